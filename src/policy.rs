//! How a failed task affects the run.

use crate::error::ConfigError;

use std::fmt;
use std::str::FromStr;

/// The rule applied to every drained completion that holds a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorPolicy {
  /// Abort the run: stop admitting, join the pool and return the failure to the caller.
  #[default]
  Raise,
  /// Report the failure through `tracing` and keep going.
  Log,
  /// Keep the failure as the task's result and keep going.
  Ignore,
}

impl ErrorPolicy {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorPolicy::Raise => "raise",
      ErrorPolicy::Log => "log",
      ErrorPolicy::Ignore => "ignore",
    }
  }
}

impl fmt::Display for ErrorPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ErrorPolicy {
  type Err = ConfigError;

  /// Parses a policy name, ignoring ASCII case and surrounding whitespace.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let name = s.trim();
    if name.eq_ignore_ascii_case("raise") {
      Ok(ErrorPolicy::Raise)
    } else if name.eq_ignore_ascii_case("log") {
      Ok(ErrorPolicy::Log)
    } else if name.eq_ignore_ascii_case("ignore") {
      Ok(ErrorPolicy::Ignore)
    } else {
      Err(ConfigError::UnknownErrorPolicy(s.to_string()))
    }
  }
}

impl TryFrom<&str> for ErrorPolicy {
  type Error = ConfigError;

  fn try_from(value: &str) -> Result<Self, Self::Error> {
    value.parse()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_is_raise() {
    assert_eq!(ErrorPolicy::default(), ErrorPolicy::Raise);
  }

  #[test]
  fn test_parse_is_case_insensitive() {
    assert_eq!("RAISE".parse::<ErrorPolicy>(), Ok(ErrorPolicy::Raise));
    assert_eq!("Log".parse::<ErrorPolicy>(), Ok(ErrorPolicy::Log));
    assert_eq!(" ignore ".parse::<ErrorPolicy>(), Ok(ErrorPolicy::Ignore));
    assert_eq!(ErrorPolicy::try_from("iGnOrE"), Ok(ErrorPolicy::Ignore));
  }

  #[test]
  fn test_unknown_name_is_config_error() {
    assert_eq!(
      "explode".parse::<ErrorPolicy>(),
      Err(ConfigError::UnknownErrorPolicy("explode".to_string()))
    );
    assert!("".parse::<ErrorPolicy>().is_err());
  }

  #[test]
  fn test_display_round_trips_through_parse() {
    for policy in [ErrorPolicy::Raise, ErrorPolicy::Log, ErrorPolicy::Ignore] {
      assert_eq!(policy.to_string().parse::<ErrorPolicy>(), Ok(policy));
    }
  }
}
