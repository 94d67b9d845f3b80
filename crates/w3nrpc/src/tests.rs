use w3npack::Decoder;
use w3npack::Encoder;

use crate::*;

fn file_ref(path: &[&str]) -> ObjectReference {
    ObjectReference::new(ObjectKind::File, path.iter().map(|s| s.to_string()).collect())
}

// ============================================================================
//  DATUM
// ============================================================================

#[test]
fn test_absent_and_empty_datum_stay_distinct() {
    let absent = Frame::Start(CallStart {
        call_num: 1,
        path: None,
        method: "ping".into(),
        data: None,
    });
    let empty = Frame::Start(CallStart {
        call_num: 2,
        path: None,
        method: "ping".into(),
        data: Some(Datum::default()),
    });

    let absent = Frame::from_bytes(&absent.to_bytes().unwrap()).unwrap();
    let empty = Frame::from_bytes(&empty.to_bytes().unwrap()).unwrap();

    let Frame::Start(absent) = absent else { panic!("expected start") };
    let Frame::Start(empty) = empty else { panic!("expected start") };
    assert_eq!(absent.data, None);
    assert_eq!(empty.data, Some(Datum::default()));
}

#[test]
fn test_reference_order_and_duplicates_preserved() {
    let datum = Datum {
        bytes: Some(b"payload".to_vec()),
        refs: Some(vec![file_ref(&["c", "1"]), file_ref(&["c", "2"]), file_ref(&["c", "1"])]),
    };
    let frame = Frame::Outcome(CallOutcome::end(9, Some(datum.clone())));

    let decoded = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
    let Frame::Outcome(outcome) = decoded else { panic!("expected outcome") };
    assert_eq!(outcome.data, Some(datum));
}

#[test]
fn test_unknown_kind_is_unsupported() {
    let mut enc = Encoder::new();
    enc.map_begin().unwrap();
    enc.entry("kind", |e| e.str("Teleporter")).unwrap();
    enc.entry("path", |e| { e.list_begin()?; e.list_end() }).unwrap();
    enc.map_end().unwrap();
    let bytes = enc.into_bytes().unwrap();

    let err = ObjectReference::decode(&mut Decoder::new(&bytes)).unwrap_err();
    assert_eq!(err, Error::UnsupportedKind("Teleporter".into()));
}

#[test]
fn test_every_kind_tag_roundtrips() {
    for kind in ObjectKind::ALL {
        assert_eq!(ObjectKind::from_tag(kind.as_tag()).unwrap(), kind);
    }
    assert_eq!(ObjectKind::FsImpl.as_tag(), "FSImpl");
    assert_eq!(ObjectKind::RpcConnection.as_tag(), "RPCConnection");
}

// ============================================================================
//  FRAMES
// ============================================================================

#[test]
fn test_start_addressed_to_object() {
    let frame = Frame::Start(CallStart {
        call_num: 42,
        path: Some(vec!["s".into(), "7".into()]),
        method: "readTxt".into(),
        data: None,
    });
    let decoded = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn test_cancel_and_close() {
    let cancel = Frame::Cancel(CallCancel { call_num: 3 });
    assert_eq!(Frame::from_bytes(&cancel.to_bytes().unwrap()).unwrap(), cancel);
    assert_eq!(Frame::from_bytes(&Frame::Close.to_bytes().unwrap()).unwrap(), Frame::Close);
}

#[test]
fn test_error_outcome_requires_err() {
    let mut enc = Encoder::new();
    enc.variant_begin("outcome").unwrap();
    enc.map_begin().unwrap();
    enc.entry("callNum", |e| e.u64(1)).unwrap();
    enc.entry("callStatus", |e| e.str("error")).unwrap();
    enc.map_end().unwrap();
    enc.variant_end().unwrap();
    let bytes = enc.into_bytes().unwrap();

    assert_eq!(Frame::from_bytes(&bytes).unwrap_err(), Error::MissingField("err"));
}

#[test]
fn test_unknown_frame_type() {
    let mut enc = Encoder::new();
    enc.variant_begin("teleport").unwrap();
    enc.unit().unwrap();
    enc.variant_end().unwrap();
    let bytes = enc.into_bytes().unwrap();

    assert!(matches!(Frame::from_bytes(&bytes), Err(Error::UnknownVariant(_))));
}

#[test]
fn test_unknown_fields_are_skipped() {
    let mut enc = Encoder::new();
    enc.variant_begin("cancel").unwrap();
    enc.map_begin().unwrap();
    enc.entry("priority", |e| e.u64(9)).unwrap();
    enc.entry("callNum", |e| e.u64(5)).unwrap();
    enc.map_end().unwrap();
    enc.variant_end().unwrap();
    let bytes = enc.into_bytes().unwrap();

    assert_eq!(Frame::from_bytes(&bytes).unwrap(), Frame::Cancel(CallCancel { call_num: 5 }));
}

#[test]
fn test_peek_header_survives_bad_payload() {
    let frame = Frame::Start(CallStart {
        call_num: 11,
        path: None,
        method: "pass".into(),
        data: Some(Datum { bytes: None, refs: Some(vec![file_ref(&["c", "1"])]) }),
    });
    let mut bytes = frame.to_bytes().unwrap();

    // corrupt the kind tag: "File" -> "Fxle"
    let pos = bytes.windows(4).position(|w| w == b"File").unwrap();
    bytes[pos + 1] = b'x';

    assert!(matches!(Frame::from_bytes(&bytes), Err(Error::UnsupportedKind(_))));
    assert_eq!(peek_header(&bytes).unwrap(), FrameHeader::Start(11));
}

#[test]
fn test_peek_header_variants() {
    let outcome = Frame::Outcome(CallOutcome::interim(4, None)).to_bytes().unwrap();
    assert_eq!(peek_header(&outcome).unwrap(), FrameHeader::Outcome(4));
    let close = Frame::Close.to_bytes().unwrap();
    assert_eq!(peek_header(&close).unwrap(), FrameHeader::Close);
}

// ============================================================================
//  FAILURES AND EXCEPTIONS
// ============================================================================

#[test]
fn test_exception_uses_flat_boolean_markers() {
    let exc = RpcException::new("chat.app", "dialog", ExceptionKind::ServiceNotFound)
        .with_caller(Some("other.app".into()), None);

    let mut enc = Encoder::new();
    exc.encode(&mut enc).unwrap();
    let bytes = enc.into_bytes().unwrap();

    let mut dec = Decoder::new(&bytes);
    let mut map = dec.map().unwrap();
    let mut keys = Vec::new();
    while let Some((key, mut val)) = map.next().unwrap() {
        if key == "serviceNotFound" {
            assert!(val.bool().unwrap());
        } else {
            val.skip().unwrap();
        }
        keys.push(key.to_string());
    }
    assert!(keys.contains(&"type".to_string()));
    assert!(keys.contains(&"serviceNotFound".to_string()));
    assert!(keys.contains(&"callerApp".to_string()));
    assert!(!keys.contains(&"callerComponent".to_string()));

    let decoded = RpcException::decode(&mut Decoder::new(&bytes)).unwrap();
    assert_eq!(decoded, exc);
}

#[test]
fn test_connection_closed_keeps_reason() {
    let exc = RpcException::new("a", "b", ExceptionKind::ConnectionClosed(CloseReason::TransportFailure))
        .with_method("readBytes");
    let frame = Frame::Outcome(CallOutcome::error(2, FailureReason::Rpc(exc.clone())));

    let Frame::Outcome(outcome) = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap() else {
        panic!("expected outcome");
    };
    let err = outcome.err.unwrap();
    assert_eq!(err.as_rpc(), Some(&exc));
    assert!(err.to_string().contains("closed by transport"));
}

#[test]
fn test_exception_without_marker_is_rejected() {
    let mut enc = Encoder::new();
    enc.map_begin().unwrap();
    enc.entry("type", |e| e.str("rpc")).unwrap();
    enc.entry("appDomain", |e| e.str("a")).unwrap();
    enc.entry("service", |e| e.str("s")).unwrap();
    enc.entry("serviceNotFound", |e| e.bool(false)).unwrap();
    enc.map_end().unwrap();
    let bytes = enc.into_bytes().unwrap();

    assert!(matches!(
        RpcException::decode(&mut Decoder::new(&bytes)),
        Err(Error::ProtocolViolation(_))
    ));
}

#[test]
fn test_handler_failure_text_survives() {
    let frame = Frame::Outcome(CallOutcome::error(8, FailureReason::Handler("disk on fire".into())));
    let Frame::Outcome(outcome) = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap() else {
        panic!("expected outcome");
    };
    assert_eq!(outcome.status, CallStatus::Error);
    assert_eq!(outcome.err, Some(FailureReason::Handler("disk on fire".into())));
}
