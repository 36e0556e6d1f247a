use std::{
    str::{from_utf8, FromStr},
    time::Duration,
};

use anyhow::{bail, Error as AnyError};

/// Configuration of the transfer engine
///
/// Values which are not set explicitly can be filled from
/// environment variables via the `from_env*` constructors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Ceiling for the number of concurrent part workers
    pub max_concurrency: MaxConcurrency,
    /// How many whole transfers may fail in a row before a batch gives up
    pub max_consecutive_errors: MaxConsecutiveErrors,
    /// Smallest backoff sleep after a transient failure
    pub backoff_floor_secs: BackoffFloorSecs,
    /// Largest backoff sleep after a transient failure
    pub backoff_ceiling_secs: BackoffCeilingSecs,
    /// Completed parts per concurrency governor decision window
    pub governor_window_parts: GovernorWindowParts,
    /// Overall deadline for a single transfer. 0 disables the deadline.
    pub transfer_timeout_secs: TransferTimeoutSecs,
    /// Minimum part size used when the session negotiated none
    pub fallback_min_part_size: FallbackMinPartSize,
    /// Recommended part size used when the session negotiated none
    pub fallback_recommended_part_size: FallbackRecommendedPartSize,
    /// Log transfer started/completed messages on debug level instead of info
    pub log_transfer_messages_as_debug: LogTransferMessagesAsDebug,
}

impl Config {
    env_ctors!();

    pub fn max_concurrency<T: Into<MaxConcurrency>>(mut self, max_concurrency: T) -> Self {
        self.max_concurrency = max_concurrency.into();
        self
    }

    pub fn max_consecutive_errors<T: Into<MaxConsecutiveErrors>>(
        mut self,
        max_consecutive_errors: T,
    ) -> Self {
        self.max_consecutive_errors = max_consecutive_errors.into();
        self
    }

    pub fn backoff_floor_secs<T: Into<BackoffFloorSecs>>(mut self, backoff_floor_secs: T) -> Self {
        self.backoff_floor_secs = backoff_floor_secs.into();
        self
    }

    pub fn backoff_ceiling_secs<T: Into<BackoffCeilingSecs>>(
        mut self,
        backoff_ceiling_secs: T,
    ) -> Self {
        self.backoff_ceiling_secs = backoff_ceiling_secs.into();
        self
    }

    pub fn governor_window_parts<T: Into<GovernorWindowParts>>(
        mut self,
        governor_window_parts: T,
    ) -> Self {
        self.governor_window_parts = governor_window_parts.into();
        self
    }

    pub fn transfer_timeout_secs<T: Into<TransferTimeoutSecs>>(
        mut self,
        transfer_timeout_secs: T,
    ) -> Self {
        self.transfer_timeout_secs = transfer_timeout_secs.into();
        self
    }

    pub fn fallback_min_part_size<T: Into<FallbackMinPartSize>>(
        mut self,
        fallback_min_part_size: T,
    ) -> Self {
        self.fallback_min_part_size = fallback_min_part_size.into();
        self
    }

    pub fn fallback_recommended_part_size<T: Into<FallbackRecommendedPartSize>>(
        mut self,
        fallback_recommended_part_size: T,
    ) -> Self {
        self.fallback_recommended_part_size = fallback_recommended_part_size.into();
        self
    }

    pub fn log_transfer_messages_as_debug<T: Into<LogTransferMessagesAsDebug>>(
        mut self,
        log_transfer_messages_as_debug: T,
    ) -> Self {
        self.log_transfer_messages_as_debug = log_transfer_messages_as_debug.into();
        self
    }

    /// Validates this [Config] and clamps out of range values
    ///
    /// `max_concurrency` and `max_consecutive_errors` are clamped
    /// up to 1. Part sizes of 0 are rejected.
    pub fn validated(mut self) -> Result<Self, AnyError> {
        if self.max_concurrency.0 == 0 {
            self.max_concurrency = MaxConcurrency(1);
        }

        if self.max_consecutive_errors.0 == 0 {
            self.max_consecutive_errors = MaxConsecutiveErrors(1);
        }

        if self.fallback_min_part_size.0 == 0 {
            bail!("'fallback_min_part_size' must not be 0");
        }

        if self.fallback_recommended_part_size.0 == 0 {
            bail!("'fallback_recommended_part_size' must not be 0");
        }

        if self.backoff_ceiling_secs.0 < self.backoff_floor_secs.0 {
            bail!(
                "'backoff_ceiling_secs' ({}) must not be less than 'backoff_floor_secs' ({})",
                self.backoff_ceiling_secs.0,
                self.backoff_floor_secs.0
            );
        }

        if self.governor_window_parts.0 == 0 {
            bail!("'governor_window_parts' must not be 0");
        }

        Ok(self)
    }

    pub(crate) fn transfer_timeout(&self) -> Option<Duration> {
        if self.transfer_timeout_secs.0 == 0 {
            None
        } else {
            Some(Duration::from_secs(self.transfer_timeout_secs.0))
        }
    }

    fn fill_from_env_prefixed_internal<T: AsRef<str>>(
        &mut self,
        prefix: T,
    ) -> Result<(), AnyError> {
        if let Some(max_concurrency) = MaxConcurrency::try_from_env_prefixed(prefix.as_ref())? {
            self.max_concurrency = max_concurrency;
        }
        if let Some(max_consecutive_errors) =
            MaxConsecutiveErrors::try_from_env_prefixed(prefix.as_ref())?
        {
            self.max_consecutive_errors = max_consecutive_errors;
        }
        if let Some(backoff_floor_secs) = BackoffFloorSecs::try_from_env_prefixed(prefix.as_ref())?
        {
            self.backoff_floor_secs = backoff_floor_secs;
        }
        if let Some(backoff_ceiling_secs) =
            BackoffCeilingSecs::try_from_env_prefixed(prefix.as_ref())?
        {
            self.backoff_ceiling_secs = backoff_ceiling_secs;
        }
        if let Some(governor_window_parts) =
            GovernorWindowParts::try_from_env_prefixed(prefix.as_ref())?
        {
            self.governor_window_parts = governor_window_parts;
        }
        if let Some(transfer_timeout_secs) =
            TransferTimeoutSecs::try_from_env_prefixed(prefix.as_ref())?
        {
            self.transfer_timeout_secs = transfer_timeout_secs;
        }
        if let Some(fallback_min_part_size) =
            FallbackMinPartSize::try_from_env_prefixed(prefix.as_ref())?
        {
            self.fallback_min_part_size = fallback_min_part_size;
        }
        if let Some(fallback_recommended_part_size) =
            FallbackRecommendedPartSize::try_from_env_prefixed(prefix.as_ref())?
        {
            self.fallback_recommended_part_size = fallback_recommended_part_size;
        }
        if let Some(log_transfer_messages_as_debug) =
            LogTransferMessagesAsDebug::try_from_env_prefixed(prefix.as_ref())?
        {
            self.log_transfer_messages_as_debug = log_transfer_messages_as_debug;
        }

        Ok(())
    }
}

new_type! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct MaxConcurrency(usize, env="MAX_CONCURRENCY");
}

impl Default for MaxConcurrency {
    fn default() -> Self {
        MaxConcurrency(4)
    }
}

new_type! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct MaxConsecutiveErrors(usize, env="MAX_CONSECUTIVE_ERRORS");
}

impl Default for MaxConsecutiveErrors {
    fn default() -> Self {
        MaxConsecutiveErrors(8)
    }
}

new_type! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct BackoffFloorSecs(u64, env="BACKOFF_FLOOR_SECS");
}

impl Default for BackoffFloorSecs {
    fn default() -> Self {
        BackoffFloorSecs(1)
    }
}

impl From<BackoffFloorSecs> for Duration {
    fn from(v: BackoffFloorSecs) -> Self {
        Duration::from_secs(v.0)
    }
}

new_type! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct BackoffCeilingSecs(u64, env="BACKOFF_CEILING_SECS");
}

impl Default for BackoffCeilingSecs {
    fn default() -> Self {
        BackoffCeilingSecs(64)
    }
}

impl From<BackoffCeilingSecs> for Duration {
    fn from(v: BackoffCeilingSecs) -> Self {
        Duration::from_secs(v.0)
    }
}

new_type! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct GovernorWindowParts(usize, env="GOVERNOR_WINDOW_PARTS");
}

impl Default for GovernorWindowParts {
    fn default() -> Self {
        GovernorWindowParts(16)
    }
}

new_type! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct TransferTimeoutSecs(u64, env="TRANSFER_TIMEOUT_SECS");
}

impl Default for TransferTimeoutSecs {
    fn default() -> Self {
        TransferTimeoutSecs(0)
    }
}

new_type! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct LogTransferMessagesAsDebug(bool, env="LOG_TRANSFER_MESSAGES_AS_DEBUG");
}

impl Default for LogTransferMessagesAsDebug {
    fn default() -> Self {
        LogTransferMessagesAsDebug(false)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FallbackMinPartSize(u64);

impl FallbackMinPartSize {
    pub fn new<T: Into<u64>>(size: T) -> Self {
        Self(size.into())
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }

    env_funs!("FALLBACK_MIN_PART_SIZE");
}

impl Default for FallbackMinPartSize {
    fn default() -> Self {
        FallbackMinPartSize::new(Mebi(5))
    }
}

impl From<u64> for FallbackMinPartSize {
    fn from(v: u64) -> Self {
        FallbackMinPartSize(v)
    }
}

impl From<FallbackMinPartSize> for u64 {
    fn from(v: FallbackMinPartSize) -> Self {
        v.0
    }
}

impl From<Kilo> for FallbackMinPartSize {
    fn from(v: Kilo) -> Self {
        FallbackMinPartSize::new(v)
    }
}

impl From<Mega> for FallbackMinPartSize {
    fn from(v: Mega) -> Self {
        FallbackMinPartSize::new(v)
    }
}

impl From<Giga> for FallbackMinPartSize {
    fn from(v: Giga) -> Self {
        FallbackMinPartSize::new(v)
    }
}

impl From<Kibi> for FallbackMinPartSize {
    fn from(v: Kibi) -> Self {
        FallbackMinPartSize::new(v)
    }
}

impl From<Mebi> for FallbackMinPartSize {
    fn from(v: Mebi) -> Self {
        FallbackMinPartSize::new(v)
    }
}

impl From<Gibi> for FallbackMinPartSize {
    fn from(v: Gibi) -> Self {
        FallbackMinPartSize::new(v)
    }
}

impl FromStr for FallbackMinPartSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_byte_size(s).map(FallbackMinPartSize)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FallbackRecommendedPartSize(u64);

impl FallbackRecommendedPartSize {
    pub fn new<T: Into<u64>>(size: T) -> Self {
        Self(size.into())
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }

    env_funs!("FALLBACK_RECOMMENDED_PART_SIZE");
}

impl Default for FallbackRecommendedPartSize {
    fn default() -> Self {
        FallbackRecommendedPartSize::new(Mebi(100))
    }
}

impl From<u64> for FallbackRecommendedPartSize {
    fn from(v: u64) -> Self {
        FallbackRecommendedPartSize(v)
    }
}

impl From<FallbackRecommendedPartSize> for u64 {
    fn from(v: FallbackRecommendedPartSize) -> Self {
        v.0
    }
}

impl From<Kilo> for FallbackRecommendedPartSize {
    fn from(v: Kilo) -> Self {
        FallbackRecommendedPartSize::new(v)
    }
}

impl From<Mega> for FallbackRecommendedPartSize {
    fn from(v: Mega) -> Self {
        FallbackRecommendedPartSize::new(v)
    }
}

impl From<Giga> for FallbackRecommendedPartSize {
    fn from(v: Giga) -> Self {
        FallbackRecommendedPartSize::new(v)
    }
}

impl From<Kibi> for FallbackRecommendedPartSize {
    fn from(v: Kibi) -> Self {
        FallbackRecommendedPartSize::new(v)
    }
}

impl From<Mebi> for FallbackRecommendedPartSize {
    fn from(v: Mebi) -> Self {
        FallbackRecommendedPartSize::new(v)
    }
}

impl From<Gibi> for FallbackRecommendedPartSize {
    fn from(v: Gibi) -> Self {
        FallbackRecommendedPartSize::new(v)
    }
}

impl FromStr for FallbackRecommendedPartSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_byte_size(s).map(FallbackRecommendedPartSize)
    }
}

fn parse_byte_size(s: &str) -> Result<u64, AnyError> {
    let s = s.trim();
    if let Some(idx) = s.find(|c: char| c.is_alphabetic()) {
        if idx == 0 {
            bail!("'{}' needs digits", s)
        }

        let digits = from_utf8(&s.as_bytes()[0..idx])?.trim();
        let unit = from_utf8(&s.as_bytes()[idx..])?.trim();

        let bytes = digits.parse::<u64>()?;

        match unit {
            "k" => Ok(u64::from(Kilo(bytes))),
            "M" => Ok(u64::from(Mega(bytes))),
            "G" => Ok(u64::from(Giga(bytes))),
            "Ki" => Ok(u64::from(Kibi(bytes))),
            "Mi" => Ok(u64::from(Mebi(bytes))),
            "Gi" => Ok(u64::from(Gibi(bytes))),
            s => bail!("invalid unit: '{}'", s),
        }
    } else {
        Ok(s.parse()?)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Kilo(pub u64);

impl From<Kilo> for u64 {
    fn from(m: Kilo) -> Self {
        m.0 * 1_000
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mega(pub u64);

impl From<Mega> for u64 {
    fn from(m: Mega) -> Self {
        m.0 * 1_000_000
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Giga(pub u64);

impl From<Giga> for u64 {
    fn from(m: Giga) -> Self {
        m.0 * 1_000_000_000
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Kibi(pub u64);

impl From<Kibi> for u64 {
    fn from(m: Kibi) -> Self {
        m.0 * 1_024
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mebi(pub u64);

impl From<Mebi> for u64 {
    fn from(m: Mebi) -> Self {
        m.0 * 1_024 * 1_024
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gibi(pub u64);

impl From<Gibi> for u64 {
    fn from(m: Gibi) -> Self {
        m.0 * 1_024 * 1_024 * 1_024
    }
}
