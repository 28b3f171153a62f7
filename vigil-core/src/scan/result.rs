use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result kinds as named on the control protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultType {
    Alarm,
    Log,
    Error,
    HostDetail,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Alarm => "Alarm",
            ResultType::Log => "Log Message",
            ResultType::Error => "Error Message",
            ResultType::HostDetail => "Host Detail",
        }
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown result type: {0}")]
pub struct UnknownResultType(pub String);

impl FromStr for ResultType {
    type Err = UnknownResultType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Alarm" => Ok(ResultType::Alarm),
            "Log Message" => Ok(ResultType::Log),
            "Error Message" => Ok(ResultType::Error),
            "Host Detail" => Ok(ResultType::HostDetail),
            other => Err(UnknownResultType(other.to_string())),
        }
    }
}

/// One finding reported by the engine. Each kind carries only the fields it
/// uses; entries with unknown fields are rejected on decode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ScanResult {
    Alarm {
        host: String,
        #[serde(default)]
        hostname: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        value: String,
        #[serde(default)]
        port: String,
        #[serde(default)]
        test_id: String,
        #[serde(default)]
        severity: String,
        #[serde(default)]
        qod: String,
    },
    Log {
        host: String,
        #[serde(default)]
        hostname: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        value: String,
        #[serde(default)]
        port: String,
        #[serde(default)]
        test_id: String,
        #[serde(default)]
        qod: String,
    },
    Error {
        #[serde(default)]
        host: String,
        #[serde(default)]
        hostname: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        value: String,
        #[serde(default)]
        port: String,
        #[serde(default)]
        test_id: String,
    },
    HostDetail {
        host: String,
        #[serde(default)]
        hostname: String,
        name: String,
        value: String,
    },
}

impl ScanResult {
    /// Error entry attributed to `host`.
    pub fn error(host: impl Into<String>, value: impl Into<String>) -> Self {
        ScanResult::Error {
            host: host.into(),
            hostname: String::new(),
            name: String::new(),
            value: value.into(),
            port: String::new(),
            test_id: String::new(),
        }
    }

    pub fn result_type(&self) -> ResultType {
        match self {
            ScanResult::Alarm { .. } => ResultType::Alarm,
            ScanResult::Log { .. } => ResultType::Log,
            ScanResult::Error { .. } => ResultType::Error,
            ScanResult::HostDetail { .. } => ResultType::HostDetail,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            ScanResult::Alarm { host, .. }
            | ScanResult::Log { host, .. }
            | ScanResult::Error { host, .. }
            | ScanResult::HostDetail { host, .. } => host,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            ScanResult::Alarm { value, .. }
            | ScanResult::Log { value, .. }
            | ScanResult::Error { value, .. }
            | ScanResult::HostDetail { value, .. } => value,
        }
    }

    /// Decodes one engine entry. Anything that does not parse becomes an
    /// error result for `host` so it is never lost.
    pub fn from_engine(entry: &str, host: &str) -> Self {
        serde_json::from_str(entry).unwrap_or_else(|err| {
            ScanResult::error(host, format!("Malformed engine result ({err}): {entry}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_type_names_convert_both_ways() {
        for ty in [
            ResultType::Alarm,
            ResultType::Log,
            ResultType::Error,
            ResultType::HostDetail,
        ] {
            assert_eq!(ty.as_str().parse::<ResultType>().unwrap(), ty);
        }
        assert!("Warning".parse::<ResultType>().is_err());
    }

    #[test]
    fn engine_entries_decode_into_their_kind() {
        let alarm = ScanResult::from_engine(
            r#"{"type":"alarm","host":"10.0.0.1","name":"weak cipher","value":"RC4","port":"443/tcp","severity":"5.0","qod":"80"}"#,
            "10.0.0.1",
        );
        assert_eq!(alarm.result_type(), ResultType::Alarm);
        assert_eq!(alarm.value(), "RC4");

        let detail = ScanResult::from_engine(
            r#"{"type":"host-detail","host":"10.0.0.1","name":"OS","value":"linux"}"#,
            "10.0.0.1",
        );
        assert_eq!(detail.result_type(), ResultType::HostDetail);
    }

    #[test]
    fn unknown_fields_turn_into_error_results() {
        let result = ScanResult::from_engine(
            r#"{"type":"host-detail","host":"h","name":"OS","value":"linux","severity":"9"}"#,
            "h",
        );
        assert_eq!(result.result_type(), ResultType::Error);
        assert_eq!(result.host(), "h");

        let garbage = ScanResult::from_engine("not json", "h2");
        assert_eq!(garbage.result_type(), ResultType::Error);
        assert!(garbage.value().contains("not json"));
    }
}
