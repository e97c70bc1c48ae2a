//! Textual grammar for building a [`Backoff`] from configuration.
//!
//! ```text
//! exponential=initialMs:maxMs[:multiplier]   (base)
//! fibonacci=initialMs:maxMs                  (base)
//! fixed=ms                                   (base)
//! random=minMs:maxMs                         (base)
//! jitter=minRate:maxRate                      (modifier)
//! maxAttempts=n                               (modifier)
//! ```
//!
//! At most one base option is allowed; each modifier may appear at most
//! once. A missing base defaults to `exponential=200:10000:2.0`; a missing
//! `jitter` modifier defaults to `[-0.2, 0.2]`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::error::RetryError;

use super::{BackoffExt, Exponential, Fibonacci, Fixed, Random, defaults, require};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Base {
    Exponential {
        initial_millis: i64,
        max_millis: i64,
        multiplier: f64,
    },
    Fibonacci {
        initial_millis: i64,
        max_millis: i64,
    },
    Fixed {
        delay_millis: i64,
    },
    Random {
        min_millis: i64,
        max_millis: i64,
    },
}

/// A parsed, not-yet-materialized backoff specification.
///
/// Keeping the parsed fields separate from the built [`super::Backoff`]
/// lets callers inject their own RNG (e.g. a seeded one in tests) via
/// [`BackoffSpec::build_with_rng`], while [`BackoffSpec::build`] seeds from
/// OS entropy for production use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSpec {
    base: Base,
    jitter: Option<(f64, f64)>,
    max_attempts: Option<u32>,
}

impl BackoffSpec {
    /// Builds the backoff, seeding any jitter/random RNG from OS entropy.
    pub fn build(&self) -> Result<Arc<dyn super::Backoff>, RetryError> {
        self.build_with_rng(StdRng::from_os_rng())
    }

    /// Builds the backoff using the given RNG for both the `random` base
    /// (if present) and the `jitter` modifier (if present).
    ///
    /// If both draw from randomness, the `random` base gets the RNG passed
    /// here and the jitter modifier gets a second generator reseeded from
    /// it, so the two stay independent.
    pub fn build_with_rng(&self, mut rng: StdRng) -> Result<Arc<dyn super::Backoff>, RetryError> {
        let jitter_rng = StdRng::from_rng(&mut rng);
        let base: Arc<dyn super::Backoff> = match self.base {
            Base::Exponential {
                initial_millis,
                max_millis,
                multiplier,
            } => Arc::new(Exponential::new(initial_millis, max_millis, multiplier)?),
            Base::Fibonacci {
                initial_millis,
                max_millis,
            } => Arc::new(Fibonacci::new(initial_millis, max_millis)?),
            Base::Fixed { delay_millis } => Arc::new(Fixed::new(delay_millis)?),
            Base::Random {
                min_millis,
                max_millis,
            } => Arc::new(Random::new(min_millis, max_millis, rng)?),
        };

        let (min_rate, max_rate) = self
            .jitter
            .unwrap_or((defaults::JITTER_MIN_RATE, defaults::JITTER_MAX_RATE));
        let with_jitter = base.with_jitter(min_rate, max_rate, jitter_rng)?;

        match self.max_attempts {
            Some(cap) => with_jitter.with_max_attempts(cap),
            None => Ok(with_jitter),
        }
    }
}

impl FromStr for BackoffSpec {
    type Err = RetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut base: Option<Base> = None;
        let mut jitter: Option<(f64, f64)> = None;
        let mut max_attempts: Option<u32> = None;
        let mut seen_keys = std::collections::HashSet::new();

        for option in s.split(',') {
            let option = option.trim();
            if option.is_empty() {
                continue;
            }
            let (key, value) = option.split_once('=').ok_or_else(|| {
                RetryError::InvalidArgument(format!("malformed option `{option}`, expected key=value"))
            })?;

            if !seen_keys.insert(key.to_string()) {
                return Err(RetryError::InvalidArgument(format!(
                    "duplicate key `{key}` in backoff spec"
                )));
            }

            match key {
                "exponential" => {
                    if base.is_some() {
                        return Err(too_many_bases());
                    }
                    base = Some(parse_exponential(value)?);
                }
                "fibonacci" => {
                    if base.is_some() {
                        return Err(too_many_bases());
                    }
                    base = Some(parse_fibonacci(value)?);
                }
                "fixed" => {
                    if base.is_some() {
                        return Err(too_many_bases());
                    }
                    base = Some(parse_fixed(value)?);
                }
                "random" => {
                    if base.is_some() {
                        return Err(too_many_bases());
                    }
                    base = Some(parse_random(value)?);
                }
                "jitter" => {
                    jitter = Some(parse_jitter(value)?);
                }
                "maxAttempts" => {
                    max_attempts = Some(parse_max_attempts(value)?);
                }
                other => {
                    return Err(RetryError::InvalidArgument(format!(
                        "unrecognized backoff spec key `{other}`"
                    )));
                }
            }
        }

        let base = base.unwrap_or(Base::Exponential {
            initial_millis: defaults::EXPONENTIAL_INITIAL_MILLIS,
            max_millis: defaults::EXPONENTIAL_MAX_MILLIS,
            multiplier: defaults::EXPONENTIAL_MULTIPLIER,
        });

        Ok(BackoffSpec {
            base,
            jitter,
            max_attempts,
        })
    }
}

impl fmt::Display for BackoffSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            Base::Exponential {
                initial_millis,
                max_millis,
                multiplier,
            } => write!(f, "exponential={initial_millis}:{max_millis}:{multiplier}")?,
            Base::Fibonacci { initial_millis, max_millis } => {
                write!(f, "fibonacci={initial_millis}:{max_millis}")?
            }
            Base::Fixed { delay_millis } => write!(f, "fixed={delay_millis}")?,
            Base::Random { min_millis, max_millis } => write!(f, "random={min_millis}:{max_millis}")?,
        }
        if let Some((min_rate, max_rate)) = self.jitter {
            write!(f, ",jitter={min_rate}:{max_rate}")?;
        }
        if let Some(cap) = self.max_attempts {
            write!(f, ",maxAttempts={cap}")?;
        }
        Ok(())
    }
}

fn too_many_bases() -> RetryError {
    RetryError::InvalidArgument("at most one base option (exponential/fibonacci/fixed/random) is allowed".into())
}

fn parse_i64(value: &str, field: &str) -> Result<i64, RetryError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| RetryError::InvalidArgument(format!("`{field}` must be an integer, got `{value}`")))
}

fn parse_f64(value: &str, field: &str) -> Result<f64, RetryError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| RetryError::InvalidArgument(format!("`{field}` must be a number, got `{value}`")))
}

fn parse_u32(value: &str, field: &str) -> Result<u32, RetryError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| RetryError::InvalidArgument(format!("`{field}` must be a non-negative integer, got `{value}`")))
}

fn parse_exponential(value: &str) -> Result<Base, RetryError> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(RetryError::InvalidArgument(
            "exponential requires initialMs:maxMs[:multiplier]".into(),
        ));
    }
    let initial_millis = parse_i64(parts[0], "exponential initialMs")?;
    let max_millis = parse_i64(parts[1], "exponential maxMs")?;
    let multiplier = if let Some(m) = parts.get(2) {
        parse_f64(m, "exponential multiplier")?
    } else {
        defaults::EXPONENTIAL_MULTIPLIER
    };
    require(initial_millis >= 0, "exponential initialMs must be >= 0")?;
    require(max_millis > 0, "exponential maxMs must be > 0")?;
    require(initial_millis <= max_millis, "exponential initialMs must be <= maxMs")?;
    require(multiplier >= 1.0, "exponential multiplier must be >= 1.0")?;
    Ok(Base::Exponential {
        initial_millis,
        max_millis,
        multiplier,
    })
}

fn parse_fibonacci(value: &str) -> Result<Base, RetryError> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 2 {
        return Err(RetryError::InvalidArgument(
            "fibonacci requires initialMs:maxMs".into(),
        ));
    }
    let initial_millis = parse_i64(parts[0], "fibonacci initialMs")?;
    let max_millis = parse_i64(parts[1], "fibonacci maxMs")?;
    require(initial_millis >= 0, "fibonacci initialMs must be >= 0")?;
    require(max_millis > 0, "fibonacci maxMs must be > 0")?;
    require(initial_millis <= max_millis, "fibonacci initialMs must be <= maxMs")?;
    Ok(Base::Fibonacci {
        initial_millis,
        max_millis,
    })
}

fn parse_fixed(value: &str) -> Result<Base, RetryError> {
    let delay_millis = parse_i64(value, "fixed ms")?;
    require(delay_millis >= 0, "fixed ms must be >= 0")?;
    Ok(Base::Fixed { delay_millis })
}

fn parse_random(value: &str) -> Result<Base, RetryError> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 2 {
        return Err(RetryError::InvalidArgument("random requires minMs:maxMs".into()));
    }
    let min_millis = parse_i64(parts[0], "random minMs")?;
    let max_millis = parse_i64(parts[1], "random maxMs")?;
    require(min_millis >= 0, "random minMs must be >= 0")?;
    require(max_millis >= min_millis, "random maxMs must be >= minMs")?;
    Ok(Base::Random { min_millis, max_millis })
}

fn parse_jitter(value: &str) -> Result<(f64, f64), RetryError> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 2 {
        return Err(RetryError::InvalidArgument("jitter requires minRate:maxRate".into()));
    }
    let min_rate = parse_f64(parts[0], "jitter minRate")?;
    let max_rate = parse_f64(parts[1], "jitter maxRate")?;
    require(min_rate >= -1.0, "jitter minRate must be >= -1")?;
    require(max_rate <= 1.0, "jitter maxRate must be <= 1")?;
    require(min_rate <= max_rate, "jitter minRate must be <= maxRate")?;
    Ok((min_rate, max_rate))
}

fn parse_max_attempts(value: &str) -> Result<u32, RetryError> {
    let cap = parse_u32(value, "maxAttempts")?;
    require(cap >= 1, "maxAttempts must be >= 1")?;
    Ok(cap)
}
