use viiper_devices::{
    CreatedDevice, DeviceError, DeviceOptions, DeviceRegistry, FeederSession, Xbox360,
};

#[test]
fn builtin_types_are_available_case_insensitively() {
    let registry = DeviceRegistry::with_builtins();
    for name in ["xbox360", "XBOX360", "Keyboard", "mouse", "DualShock4", "steamdeck"] {
        assert!(registry.contains(name), "missing builtin {name}");
        registry
            .create(name, &DeviceOptions::default())
            .unwrap_or_else(|e| panic!("create {name}: {e}"));
    }
}

#[test]
fn unknown_type_is_an_error() {
    let registry = DeviceRegistry::with_builtins();
    match registry.create("gamecube", &DeviceOptions::default()) {
        Err(DeviceError::UnknownType(name)) => assert_eq!(name, "gamecube"),
        other => panic!("expected UnknownType, got {other:?}"),
    }
}

#[test]
fn duplicate_registration_overrides() {
    fn shadow(options: &DeviceOptions) -> Result<CreatedDevice, DeviceError> {
        let device = std::sync::Arc::new(Xbox360::new(&DeviceOptions {
            id_vendor: Some(0xbeef),
            ..options.clone()
        }));
        Ok(CreatedDevice {
            model: device.clone(),
            session: device as std::sync::Arc<dyn FeederSession>,
        })
    }

    let registry = DeviceRegistry::with_builtins();
    registry.register("XBOX360", shadow);
    let created = registry
        .create("xbox360", &DeviceOptions::default())
        .unwrap();
    assert_eq!(created.model.profile().device.id_vendor, 0xbeef);
}

#[test]
fn vid_pid_overrides_flow_through_create() {
    let registry = DeviceRegistry::with_builtins();
    let options = DeviceOptions {
        id_vendor: Some(0x1118),
        id_product: Some(0x0001),
        ..DeviceOptions::default()
    };
    let created = registry.create("keyboard", &options).unwrap();
    assert_eq!(created.model.profile().device.id_vendor, 0x1118);
    assert_eq!(created.model.profile().device.id_product, 0x0001);
}

#[test]
fn every_builtin_profile_validates() {
    let registry = DeviceRegistry::with_builtins();
    for name in ["xbox360", "keyboard", "mouse", "dualshock4", "steamdeck"] {
        let created = registry.create(name, &DeviceOptions::default()).unwrap();
        created
            .model
            .profile()
            .validate()
            .unwrap_or_else(|e| panic!("{name} profile: {e}"));
    }
}
