use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(OperationKind {
    Download => "download",
    Print => "print",
});

str_enum!(TimePoint {
    A0 => "A0",
    A1 => "A1",
    A2 => "A2",
});

str_enum!(CenterCode {
    Cmc => "CMC",
    Mnp => "MNP",
    Ldh => "LDH",
});

impl CenterCode {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Cmc => "CMC Vellore",
            Self::Mnp => "Manipal Hospital",
            Self::Ldh => "Ludhiana Hospital",
        }
    }
}

/// Semantic identity of a stamping operation: the only input the fingerprint
/// is derived from. Selection order of `files` does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationKey {
    pub time_point: TimePoint,
    pub center: CenterCode,
    pub hospital_number: String,
    pub files: Vec<String>,
    pub kind: OperationKind,
    pub merge: bool,
}

impl OperationKey {
    /// Overlay label stamped onto every page, e.g. "CMC-12345".
    pub fn label(&self) -> String {
        format!("{}-{}", self.center.as_str(), self.hospital_number)
    }
}

/// One persisted audit row. At most one live record exists per fingerprint;
/// repeats refresh timestamp, duplicate flag and reason in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: i64,
    pub timestamp: NaiveDateTime,
    pub kind: OperationKind,
    pub time_point: TimePoint,
    pub center: CenterCode,
    pub hospital_number: String,
    pub files: Vec<String>,
    pub merge: bool,
    pub is_duplicate: bool,
    pub reprint_reason: Option<String>,
    pub recorded_by: Option<String>,
    pub fingerprint: String,
    pub file_count: i64,
    pub output_location: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trip() {
        assert_eq!(OperationKind::Download.as_str(), "download");
        assert_eq!("print".parse::<OperationKind>().unwrap(), OperationKind::Print);
        assert_eq!("A1".parse::<TimePoint>().unwrap(), TimePoint::A1);
        assert_eq!("LDH".parse::<CenterCode>().unwrap(), CenterCode::Ldh);
    }

    #[test]
    fn invalid_enum_value_rejected() {
        let err = "A9".parse::<TimePoint>().unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidEnum { .. }));
    }

    #[test]
    fn center_display_names() {
        assert_eq!(CenterCode::Cmc.display_name(), "CMC Vellore");
        assert_eq!(CenterCode::Mnp.display_name(), "Manipal Hospital");
    }

    #[test]
    fn label_joins_center_and_number() {
        let key = OperationKey {
            time_point: TimePoint::A0,
            center: CenterCode::Cmc,
            hospital_number: "12345".into(),
            files: vec!["arat.pdf".into()],
            kind: OperationKind::Download,
            merge: false,
        };
        assert_eq!(key.label(), "CMC-12345");
    }
}
