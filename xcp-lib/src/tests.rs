use crate::error::{ProtocolError, ValidationError};
use crate::memory::ParameterValue;
use crate::message::{Command, ConnectInfo, ConnectMode, StatusInfo};
use crate::packet::{CommandCode, CommandRequest, CommandResponse, ErrorCode, Framing, Pid, ResponseKind};
use crate::registry::{ParameterDefinition, ParameterRegistry, ValueKind};
use bytes::Bytes;
use num_enum::FromPrimitive;

#[test]
fn test_decode_positive_response() {
    let bytes = Bytes::from(hex::decode("ff010203").unwrap());
    let response = CommandResponse::try_from(bytes).expect("Failed to parse response");

    assert_eq!(response.kind, ResponseKind::Positive);
    assert_eq!(response.pid, Pid::Res);
    assert_eq!(response.payload.as_ref(), &[0x01, 0x02, 0x03]);
}

#[test]
fn test_decode_error_response() {
    let response = CommandResponse::try_from(Bytes::from_static(&[0xFE, 0x22])).unwrap();

    assert_eq!(response.kind, ResponseKind::Error);
    assert_eq!(response.error_code(), Some(ErrorCode::OutOfRange));
    assert!(matches!(
        response.into_positive(),
        Err(ProtocolError::Device(ErrorCode::OutOfRange))
    ));
}

#[test]
fn test_decode_event_and_service_request() {
    let event = CommandResponse::try_from(Bytes::from_static(&[0xFD, 0x00])).unwrap();
    assert_eq!(event.kind, ResponseKind::Event);

    let serv = CommandResponse::try_from(Bytes::from_static(&[0xFC, 0x01])).unwrap();
    assert_eq!(serv.kind, ResponseKind::ServiceRequest);
    assert!(matches!(
        serv.into_positive(),
        Err(ProtocolError::UnexpectedResponse(Pid::Serv))
    ));

    // DAQ packets that slip into the command path are events too
    let dto = CommandResponse::try_from(Bytes::from_static(&[0x03, 0xAA])).unwrap();
    assert_eq!(dto.kind, ResponseKind::Event);
    assert_eq!(dto.pid, Pid::Dto(0x03));
}

#[test]
fn test_decode_empty_response() {
    assert!(matches!(
        CommandResponse::try_from(Bytes::new()),
        Err(ProtocolError::ShortResponse { expected: 1, actual: 0 })
    ));
}

#[test]
fn test_error_code_names() {
    assert_eq!(ErrorCode::from_primitive(0x00), ErrorCode::CmdSync);
    assert_eq!(ErrorCode::from_primitive(0x10), ErrorCode::CmdBusy);
    assert_eq!(ErrorCode::from_primitive(0x29), ErrorCode::Sequence);
    assert_eq!(ErrorCode::CmdUnknown.to_string(), "CMD_UNKNOWN");
    assert_eq!(ErrorCode::ResourceTempNotAccessible.to_string(), "RESOURCE_TEMP_NOT_ACCESSIBLE");

    let unknown = ErrorCode::from_primitive(0x7A);
    assert_eq!(unknown, ErrorCode::Unknown(0x7A));
    assert_eq!(unknown.to_string(), "0x7a");
}

#[test]
fn test_command_code_table() {
    assert_eq!(u8::from(CommandCode::Connect), 0xFF);
    assert_eq!(u8::from(CommandCode::SetMta), 0xF6);
    assert_eq!(u8::from(CommandCode::ShortDownload), 0xED);
    assert_eq!(CommandCode::from_primitive(0xC8), CommandCode::ProgramVerify);
    assert_eq!(CommandCode::from_primitive(0xC9), CommandCode::ProgramMax);
    assert_eq!(u8::from(CommandCode::Unknown(0x10)), 0x10);
    assert_eq!(CommandCode::ShortUpload.to_string(), "SHORT_UPLOAD");
    assert_eq!(CommandCode::from_primitive(0x10).to_string(), "0x10");
}

#[test]
fn test_fixed_frame_padding() {
    let request = CommandRequest::bare(CommandCode::Connect);
    let frame = Framing::FixedFrame.encode(&request).unwrap();
    assert_eq!(hex::encode(&frame), "ff00000000000000");

    let frame = Framing::Stream.encode(&request).unwrap();
    assert_eq!(frame.as_ref(), &[0xFF]);
}

#[test]
fn test_fixed_frame_set_mta_layout() {
    // SET_MTA to 0x20000000 fills the 8-byte frame exactly
    let request = Command::SetMta {
        address: 0x2000_0000,
        extension: 0,
    }
    .to_request()
    .unwrap();
    let frame = Framing::FixedFrame.encode(&request).unwrap();
    assert_eq!(frame.as_ref(), &[0xF6, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20]);
}

#[test]
fn test_fixed_frame_overflow() {
    let request = Command::ShortDownload {
        address: 0x2000_0000,
        extension: 0,
        data: Bytes::from_static(&[1, 2, 3, 4]),
    }
    .to_request()
    .unwrap();

    assert!(matches!(
        Framing::FixedFrame.encode(&request),
        Err(ValidationError::FrameOverflow { len: 12, max: 8 })
    ));
    assert_eq!(Framing::Stream.encode(&request).unwrap().len(), 12);
}

#[test]
fn test_command_encoding() {
    let cases: Vec<(Command, &str)> = vec![
        (Command::Connect { mode: ConnectMode::Normal }, "ff00"),
        (Command::Disconnect, "fe"),
        (Command::GetStatus, "fd"),
        (Command::Upload { size: 4 }, "f504"),
        (
            Command::Download {
                data: Bytes::from_static(&[0xAA, 0xBB]),
            },
            "f002aabb",
        ),
        (
            Command::ShortUpload {
                address: 0x2000_0010,
                extension: 1,
                size: 4,
            },
            "f404000110000020",
        ),
        (
            Command::ShortDownload {
                address: 0x1234_5678,
                extension: 0,
                data: Bytes::from_static(&[0x01]),
            },
            "ed0100007856341201",
        ),
    ];

    for (command, expected) in cases {
        let request = command.to_request().unwrap();
        let frame = Framing::Stream.encode(&request).unwrap();
        assert_eq!(hex::encode(&frame), expected, "Encoding mismatch for {:?}", command);
    }
}

#[test]
fn test_transfer_length_limits() {
    assert!(matches!(
        Command::Upload { size: 0 }.to_request(),
        Err(ValidationError::BadSize { size: 0, .. })
    ));
    assert!(matches!(
        Command::Upload { size: 256 }.to_request(),
        Err(ValidationError::BadSize { size: 256, .. })
    ));
}

#[test]
fn test_connect_info_full_payload() {
    let info = ConnectInfo::parse(&[0x15, 0x01, 0x08, 0x00, 0x01, 0x01, 0x02]).unwrap();

    assert!(info.resource.cal_pag());
    assert!(info.resource.daq());
    assert!(!info.resource.stim());
    assert!(info.resource.pgm());
    assert!(info.comm_mode_basic.byte_order());
    assert_eq!(info.max_cto, 8);
    assert_eq!(info.max_dto, 0x0100);
    assert_eq!(info.protocol_version, 1);
    assert_eq!(info.transport_version, 2);
}

#[test]
fn test_connect_info_without_transport_version() {
    let info = ConnectInfo::parse(&[0x01, 0x00, 0x08, 0x00, 0x01, 0x01]).unwrap();
    assert_eq!(info.max_cto, 8);
    assert_eq!(info.max_dto, 256);
    assert_eq!(info.protocol_version, 1);
    assert_eq!(info.transport_version, 0);

    assert!(matches!(
        ConnectInfo::parse(&[0x01, 0x00, 0x08]),
        Err(ProtocolError::ShortResponse { expected: 5, actual: 3 })
    ));
}

#[test]
fn test_status_info() {
    let status = StatusInfo::parse(&[0xC1, 0x04, 0x00]).unwrap();
    assert!(status.session_status.store_cal_req());
    assert!(status.session_status.daq_running());
    assert!(status.session_status.resume());
    assert!(status.resource.daq());
    assert_eq!(status.protection, 0);

    assert!(StatusInfo::parse(&[0x00, 0x00]).is_err());
}

#[test]
fn test_value_encoding_by_size() {
    assert_eq!(
        ParameterValue::Unsigned(0xAB).encode(1, ValueKind::Uint).unwrap().as_ref(),
        &[0xAB]
    );
    assert_eq!(
        ParameterValue::Unsigned(0x1234).encode(2, ValueKind::Uint).unwrap().as_ref(),
        &[0x34, 0x12]
    );
    assert_eq!(
        ParameterValue::Unsigned(0xDEAD_BEEF).encode(4, ValueKind::Uint).unwrap().as_ref(),
        &[0xEF, 0xBE, 0xAD, 0xDE]
    );
    assert_eq!(
        ParameterValue::Float(230.5).encode(4, ValueKind::Float).unwrap().as_ref(),
        &230.5f32.to_le_bytes()
    );
}

#[test]
fn test_value_encoding_rejects_unrepresentable() {
    assert!(matches!(
        ParameterValue::Unsigned(256).encode(1, ValueKind::Uint),
        Err(ValidationError::OutOfRange { size: 1, .. })
    ));
    assert!(matches!(
        ParameterValue::Float(1.5).encode(2, ValueKind::Uint),
        Err(ValidationError::OutOfRange { size: 2, .. })
    ));
    assert!(matches!(
        ParameterValue::Float(1.0).encode(2, ValueKind::Float),
        Err(ValidationError::BadSize { size: 2, .. })
    ));
    assert!(matches!(
        ParameterValue::Unsigned(1).encode(3, ValueKind::Uint),
        Err(ValidationError::BadSize { size: 3, .. })
    ));
    assert!(matches!(
        ParameterValue::Raw(Bytes::from_static(&[1, 2])).encode(3, ValueKind::Uint),
        Err(ValidationError::BadSize { size: 3, .. })
    ));
}

#[test]
fn test_value_encoding_rejects_values_past_the_type() {
    // 2^32 must not saturate to 0xFFFFFFFF
    assert!(matches!(
        ParameterValue::Float(4_294_967_296.0).encode(4, ValueKind::Uint),
        Err(ValidationError::OutOfRange { size: 4, .. })
    ));
    assert_eq!(
        ParameterValue::Float(4_294_967_040.0).encode(4, ValueKind::Uint).unwrap().as_ref(),
        &4_294_967_040u32.to_le_bytes()
    );

    assert!(matches!(
        ParameterValue::Float(f32::INFINITY).encode(4, ValueKind::Float),
        Err(ValidationError::OutOfRange { size: 4, .. })
    ));
    assert!(matches!(
        ParameterValue::Float(f32::NAN).encode(4, ValueKind::Float),
        Err(ValidationError::OutOfRange { size: 4, .. })
    ));

    let too_big = serde_json::Number::from_f64(1e39).unwrap();
    assert_eq!(ParameterValue::from_json(&too_big), None);

    let past_u32 = serde_json::Number::from(4_294_967_296u64);
    let value = ParameterValue::from_json(&past_u32).unwrap();
    assert!(value.encode(4, ValueKind::Uint).is_err());
}

#[test]
fn test_value_decoding() {
    let data = [0x00, 0x80, 0x66, 0x43, 0x99];
    assert_eq!(
        ParameterValue::decode(&data, 4, ValueKind::Float).unwrap(),
        ParameterValue::Float(230.5)
    );
    assert_eq!(
        ParameterValue::decode(&data, 4, ValueKind::Uint).unwrap(),
        ParameterValue::Unsigned(0x4366_8000)
    );
    assert_eq!(
        ParameterValue::decode(&data, 2, ValueKind::Uint).unwrap(),
        ParameterValue::Unsigned(0x8000)
    );
    assert_eq!(
        ParameterValue::decode(&data, 5, ValueKind::Uint).unwrap(),
        ParameterValue::Raw(Bytes::copy_from_slice(&data))
    );
    assert!(ParameterValue::decode(&data[..1], 2, ValueKind::Uint).is_err());
}

#[test]
fn test_value_json_conversion() {
    let number = serde_json::Number::from(42u64);
    assert_eq!(ParameterValue::from_json(&number), Some(ParameterValue::Unsigned(42)));

    let number = serde_json::Number::from_f64(12.25).unwrap();
    assert_eq!(ParameterValue::from_json(&number), Some(ParameterValue::Float(12.25)));

    assert_eq!(ParameterValue::Float(230.5).to_json(), serde_json::json!(230.5));
    assert_eq!(
        ParameterValue::Raw(Bytes::from_static(&[0xCA, 0xFE])).to_json(),
        serde_json::json!("cafe")
    );
}

#[test]
fn test_default_catalog() {
    let registry = ParameterRegistry::default_catalog();
    assert_eq!(registry.len(), 10);

    let voltage = registry.lookup_by_name("INPUT_VOLTAGE").unwrap();
    assert_eq!(voltage.address, 0x2000_0000);
    assert!(voltage.is_float());

    let temperature = registry.lookup_by_address(0x2000_0010).unwrap();
    assert_eq!(temperature.name, "TEMPERATURE");
    assert_eq!((temperature.min, temperature.max), (-20.0, 100.0));

    assert_eq!(registry.kind_of(0x2000_0024), ValueKind::Float);
    assert_eq!(registry.kind_of(0x3000_0000), ValueKind::Uint);
    assert!(registry.lookup_by_name("MISSING").is_none());
}

#[test]
fn test_registry_rejects_duplicates() {
    let dup_address = vec![
        ParameterDefinition::new("A", 0x10, 4, ValueKind::Uint, (0.0, 10.0)),
        ParameterDefinition::new("B", 0x10, 4, ValueKind::Uint, (0.0, 10.0)),
    ];
    assert!(matches!(
        ParameterRegistry::new(dup_address),
        Err(ValidationError::Catalog(msg)) if msg.contains("duplicate address")
    ));

    let dup_name = vec![
        ParameterDefinition::new("A", 0x10, 4, ValueKind::Uint, (0.0, 10.0)),
        ParameterDefinition::new("A", 0x14, 4, ValueKind::Uint, (0.0, 10.0)),
    ];
    assert!(matches!(
        ParameterRegistry::new(dup_name),
        Err(ValidationError::Catalog(msg)) if msg.contains("duplicate name")
    ));
}

#[test]
fn test_registry_rejects_bad_definitions() {
    let bad = [
        ParameterDefinition::new("SIZE", 0x10, 3, ValueKind::Uint, (0.0, 10.0)),
        ParameterDefinition::new("FLOAT16", 0x10, 2, ValueKind::Float, (0.0, 10.0)),
        ParameterDefinition::new("RANGE", 0x10, 4, ValueKind::Uint, (10.0, 0.0)),
        ParameterDefinition::new("NAN", 0x10, 4, ValueKind::Float, (f64::NAN, 1.0)),
        ParameterDefinition::new("INFINITE", 0x10, 4, ValueKind::Float, (0.0, f64::INFINITY)),
        // width overflows f64 even though both ends are finite
        ParameterDefinition::new("WIDE", 0x10, 4, ValueKind::Float, (-1e308, 1e308)),
        ParameterDefinition::new("FRACTION", 0x10, 1, ValueKind::Uint, (0.2, 0.8)),
        ParameterDefinition::new("NEGATIVE", 0x10, 2, ValueKind::Uint, (-5.0, -1.0)),
    ];
    for param in bad {
        let name = param.name.clone();
        assert!(ParameterRegistry::new(vec![param]).is_err(), "{} should be rejected", name);
    }
}

#[test]
fn test_registry_from_json() {
    let json = r#"[
        {"name": "FAN_SPEED", "address": 256, "size": 2, "type": "uint16", "min": 0, "max": 5000},
        {"name": "SETPOINT", "address": 260, "size": 4, "type": "float", "min": -1.5, "max": 1.5,
         "unit": "V", "description": "Trim"}
    ]"#;
    let registry = ParameterRegistry::from_json_str(json).unwrap();

    let fan = registry.lookup_by_address(256).unwrap();
    assert_eq!(fan.kind, ValueKind::Uint);
    assert_eq!(fan.size, 2);
    assert_eq!(registry.lookup_by_name("SETPOINT").unwrap().unit, "V");

    assert!(ParameterRegistry::from_json_str("{not json").is_err());
}

#[test]
fn test_config_defaults_and_overrides() {
    let config = crate::config::Config::from_json_str(r#"{"master": {"timeout_ms": 250}, "slave": "10.0.0.2:5555"}"#)
        .unwrap();
    assert_eq!(config.master.timeout(), std::time::Duration::from_millis(250));
    assert_eq!(config.master.poll_interval(), std::time::Duration::from_millis(10));
    assert_eq!(config.bridge.bind_addr(), "0.0.0.0:8000");
    assert_eq!(config.slave.as_deref(), Some("10.0.0.2:5555"));
}

#[test]
fn test_dispatcher_queue_and_callback() {
    use crate::receiver::{DtoDispatcher, DtoPacket};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let dispatcher = DtoDispatcher::new();
    dispatcher.deliver(DtoPacket::new(Bytes::from_static(&[0x00, 0x01])));
    dispatcher.deliver(DtoPacket::new(Bytes::from_static(&[0x01, 0x02])));
    assert_eq!(dispatcher.queued(), 2);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    dispatcher.register_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    dispatcher.deliver(DtoPacket::new(Bytes::from_static(&[0x02])));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.queued(), 2, "callback packets bypass the queue");

    let drained = dispatcher.drain();
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].hex_string(), "0001");
    assert_eq!(dispatcher.queued(), 0);
}

#[test]
fn test_pid_table() {
    assert_eq!(Pid::from_primitive(0xFF), Pid::Res);
    assert_eq!(Pid::from_primitive(0xFE), Pid::Err);
    assert_eq!(Pid::from_primitive(0xFD), Pid::Ev);
    assert_eq!(Pid::from_primitive(0xFC), Pid::Serv);
    assert_eq!(Pid::from_primitive(0x00), Pid::Dto(0x00));
    assert_eq!(Pid::from_primitive(0xFB), Pid::Dto(0xFB));
    assert_eq!(u8::from(Pid::Dto(0x42)), 0x42);
    assert_eq!(u8::from(Pid::Ev), 0xFD);
}

#[test]
fn test_registry_uint_range_needs_an_integer() {
    let ok = ParameterRegistry::new(vec![ParameterDefinition::new(
        "MODE",
        0x10,
        1,
        ValueKind::Uint,
        (-3.0, 0.5),
    )]);
    assert!(ok.is_ok(), "0 lies inside [-3, 0.5]");

    let err = ParameterRegistry::new(vec![ParameterDefinition::new(
        "FRACTION",
        0x10,
        1,
        ValueKind::Uint,
        (0.2, 0.8),
    )])
    .unwrap_err();
    assert!(err.to_string().contains("no unsigned integer"), "unexpected error: {}", err);
}

#[test]
fn test_poisoned_bookkeeping_lock_is_recovered() {
    use crate::master::lock_unpoisoned;
    use std::sync::{Arc, Mutex};

    let slot = Arc::new(Mutex::new(Some(7u32)));
    let poisoner = slot.clone();
    let _ = std::thread::spawn(move || {
        let _guard = poisoner.lock().unwrap();
        panic!("poison the slot");
    })
    .join();
    assert!(slot.is_poisoned());

    assert_eq!(*lock_unpoisoned(&slot), Some(7));
    *lock_unpoisoned(&slot) = None;
    assert_eq!(*lock_unpoisoned(&slot), None);
}
