//! Macros for the configuration newtypes

/// Generates the environment lookup functions for a configuration value.
///
/// The environment variable is the given name prefixed with
/// "PARTLIFT_" unless an explicit prefix is used.
macro_rules! env_funs {
    ($var:expr) => {
        /// The name of the environment variable without any prefix
        pub const ENV_TYPE_NAME: &'static str = $var;

        /// Try to initialize `Self` from the environment variable
        /// with the default prefix "PARTLIFT"
        pub fn try_from_env() -> Result<Option<Self>, anyhow::Error> {
            Self::try_from_env_prefixed("PARTLIFT")
        }

        /// Try to initialize `Self` from the environment variable
        /// prefixed with the given prefix
        pub fn try_from_env_prefixed<T: AsRef<str>>(
            prefix: T,
        ) -> Result<Option<Self>, anyhow::Error> {
            let name = format!("{}_{}", prefix.as_ref(), Self::ENV_TYPE_NAME);
            Self::try_from_env_named(name)
        }

        /// Try to initialize `Self` from the environment variable
        /// with the given name
        pub fn try_from_env_named<T: AsRef<str>>(
            name: T,
        ) -> Result<Option<Self>, anyhow::Error> {
            match std::env::var(name.as_ref()) {
                Ok(value) => value.parse().map(Some).map_err(|err| {
                    anyhow::anyhow!(
                        "could not parse env var '{}': {}",
                        name.as_ref(),
                        err
                    )
                }),
                Err(std::env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(anyhow::anyhow!(
                    "could not read env var '{}': {}",
                    name.as_ref(),
                    err
                )),
            }
        }
    };
}

/// Generates a `Copy` newtype wrapping a single configuration value
/// including conversions and environment lookup functions.
macro_rules! new_type {
    ($(#[$attr:meta])* pub copy struct $name:ident($inner:ty, env=$var:expr);) => {
        $(#[$attr])*
        pub struct $name($inner);

        impl $name {
            pub fn new<T: Into<$inner>>(value: T) -> Self {
                Self(value.into())
            }

            pub fn into_inner(self) -> $inner {
                self.0
            }

            env_funs!($var);
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $inner {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = $inner;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let inner = s
                    .trim()
                    .parse::<$inner>()
                    .map_err(|err| anyhow::anyhow!("'{}': {}", s, err))?;
                Ok(Self(inner))
            }
        }
    };
}

/// Generates the environment based constructors for a configuration struct.
///
/// Requires a `fill_from_env_prefixed_internal` method on the struct.
macro_rules! env_ctors {
    () => {
        /// Initialize from environment variables prefixed with "PARTLIFT"
        pub fn from_env() -> Result<Self, anyhow::Error> {
            Self::from_env_prefixed("PARTLIFT")
        }

        /// Initialize from environment variables with the given prefix
        pub fn from_env_prefixed<T: AsRef<str>>(prefix: T) -> Result<Self, anyhow::Error> {
            let mut me = Self::default();
            me.fill_from_env_prefixed_internal(prefix)?;
            Ok(me)
        }

        /// Update from environment variables prefixed with "PARTLIFT"
        pub fn fill_from_env(&mut self) -> Result<(), anyhow::Error> {
            self.fill_from_env_prefixed_internal("PARTLIFT")
        }

        /// Update from environment variables with the given prefix
        pub fn fill_from_env_prefixed<T: AsRef<str>>(
            &mut self,
            prefix: T,
        ) -> Result<(), anyhow::Error> {
            self.fill_from_env_prefixed_internal(prefix)
        }
    };
}
