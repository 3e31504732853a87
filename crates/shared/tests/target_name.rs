#![allow(missing_docs)]

use shared::{TargetName, TargetNameError};

#[test]
fn valid_names() {
    for name in ["db", "web_1", "app.frontend", "a-b-c", "9lives"] {
        assert!(TargetName::try_from(name).is_ok(), "{name} should be valid");
    }
}

#[test]
fn empty_name() {
    assert_eq!(TargetName::try_from(""), Err(TargetNameError::Empty));
}

#[test]
fn leading_symbol() {
    assert_eq!(TargetName::try_from("-db"), Err(TargetNameError::Invalid(0, '-')));
}

#[test]
fn invalid_character() {
    assert_eq!(TargetName::try_from("db/../etc"), Err(TargetNameError::Invalid(2, '/')));
}

#[test]
fn too_long() {
    let name = "a".repeat(129);
    assert_eq!(TargetName::try_from(name), Err(TargetNameError::TooLong(129, 128)));
}

#[test]
fn deserialize_validates() {
    let result: Result<TargetName, _> = serde_json::from_str("\"bad name\"");
    assert!(result.is_err());
}
