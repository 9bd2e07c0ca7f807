//! Typed uid definitions.
//!
//! A uid identifies one incarnation of an object: deleting and re-creating an
//! object under the same key yields a different uid.

use crate::macros::define_uid;

define_uid!(
    /// Uid assigned to an object when it is first stored.
    ObjectUid,
    "uid"
);

define_uid!(
    /// Identifier of one reconcile attempt, used to correlate log lines.
    AttemptId,
    "att"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;

    #[test]
    fn test_uid_roundtrip() {
        let uid = ObjectUid::new();
        let parsed: ObjectUid = uid.to_string().parse().unwrap();
        assert_eq!(uid, parsed);
        assert!(uid.to_string().starts_with("uid_"));
    }

    #[test]
    fn test_uid_wrong_prefix() {
        let err = "att_01HV4Z2WQXKJNM8GPQY6VBKC3D"
            .parse::<ObjectUid>()
            .unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_uid_missing_separator() {
        let err = "uid01HV4Z2WQXKJNM8GPQY6VBKC3D"
            .parse::<ObjectUid>()
            .unwrap_err();
        assert_eq!(err, IdError::MissingSeparator);
    }

    #[test]
    fn test_uid_empty_and_bad_ulid() {
        assert!("".parse::<ObjectUid>().unwrap_err().is_empty());
        assert!(matches!(
            "uid_nope".parse::<ObjectUid>(),
            Err(IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_uid_json_is_string() {
        let uid = ObjectUid::new();
        let json = serde_json::to_string(&uid).unwrap();
        assert_eq!(json, format!("\"{uid}\""));
        let back: ObjectUid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uid);
    }

    #[test]
    fn test_prefixes_unique() {
        assert_ne!(ObjectUid::PREFIX, AttemptId::PREFIX);
    }
}
