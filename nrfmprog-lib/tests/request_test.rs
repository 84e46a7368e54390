use nrfmprog_lib::{
    DeviceFamily, EraseMode, Error, ProgramOptions, ProgrammingRequest, TargetId,
};
use std::str::FromStr;

#[test]
fn test_family_defaults_to_nrf51() {
    let request =
        ProgrammingRequest::new("app.hex", None, Vec::new(), ProgramOptions::default()).unwrap();

    assert_eq!(request.family(), DeviceFamily::Nrf51);
    assert_eq!(request.erase_mode(), EraseMode::None);
    assert!(request.targets().is_empty());
    assert!(!request.verify());
    assert!(!request.system_reset());
}

#[test]
fn test_family_parses_case_insensitively() {
    assert_eq!(DeviceFamily::from_str("nrf52").unwrap(), DeviceFamily::Nrf52);
    assert_eq!(DeviceFamily::from_str("NRF51").unwrap(), DeviceFamily::Nrf51);
    assert!(DeviceFamily::from_str("NRF53").is_err());
    assert_eq!(DeviceFamily::Nrf52.to_string(), "NRF52");
}

#[test]
fn test_erase_flags_map_to_modes() {
    let cases = [
        (ProgramOptions::default(), EraseMode::None),
        (
            ProgramOptions {
                erase_all: true,
                ..Default::default()
            },
            EraseMode::All,
        ),
        (
            ProgramOptions {
                sectors_erase: true,
                ..Default::default()
            },
            EraseMode::Sectors,
        ),
        (
            ProgramOptions {
                sectors_and_uicr_erase: true,
                ..Default::default()
            },
            EraseMode::SectorsAndUicr,
        ),
    ];

    for (options, expected) in cases {
        assert_eq!(options.erase_mode().unwrap(), expected);
    }
}

#[test]
fn test_conflicting_erase_flags_are_rejected() {
    let options = ProgramOptions {
        erase_all: true,
        sectors_and_uicr_erase: true,
        verify: true,
        ..Default::default()
    };

    let err = ProgrammingRequest::new(
        "app.hex",
        Some(DeviceFamily::Nrf52),
        vec![TargetId::from("1")],
        options,
    )
    .unwrap_err();

    match err {
        Error::EraseModeConflict(names) => {
            assert_eq!(names, vec!["eraseall", "sectorsanduicrerase"]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_targets_keep_order_and_duplicates() {
    let targets = vec![
        TargetId::from(683000001u64),
        TargetId::from("683000002"),
        TargetId::from(683000001u64),
    ];

    let request = ProgrammingRequest::new(
        "app.hex",
        Some(DeviceFamily::Nrf52),
        targets.clone(),
        ProgramOptions {
            verify: true,
            system_reset: true,
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(request.targets(), targets.as_slice());
    assert!(request.verify());
    assert!(request.system_reset());
}
