use crate::*;

#[test]
fn test_scalars_in_order() -> Result<()> {
    let mut enc = Encoder::new();
    enc.bool(true)?;
    enc.u64(u64::MAX)?;
    enc.unit()?;
    enc.str("hello 🦀")?;
    enc.bytes(&[0, 1, 2])?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);

    assert!(dec.bool()?);
    assert_eq!(dec.u64()?, u64::MAX);
    dec.unit()?;
    assert_eq!(dec.str()?, "hello 🦀");
    assert_eq!(dec.bytes()?, &[0, 1, 2]);
    assert!(dec.is_empty());
    Ok(())
}

#[test]
fn test_map_entries_and_unknown_keys_skipped() -> Result<()> {
    let mut enc = Encoder::new();
    enc.map_begin()?;
    enc.entry("seq", |e| e.u64(7))?;
    enc.entry("future-field", |e| {
        e.list_begin()?;
        e.str("ignored")?;
        e.list_end()
    })?;
    enc.entry("method", |e| e.str("readTxt"))?;
    enc.map_end()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    let mut map = dec.map()?;

    let mut seq = None;
    let mut method = None;
    while let Some((key, mut val)) = map.next()? {
        match key {
            "seq" => seq = Some(val.u64()?),
            "method" => method = Some(val.str()?),
            _ => val.skip()?,
        }
    }

    assert_eq!(seq, Some(7));
    assert_eq!(method, Some("readTxt"));
    Ok(())
}

#[test]
fn test_option_absent_vs_empty() -> Result<()> {
    let mut enc = Encoder::new();
    enc.option_none()?;
    enc.option_some_begin()?;
    enc.bytes(&[])?;
    enc.option_some_end()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);

    assert!(dec.option()?.is_none());
    let mut some = dec.option()?.expect("second option is present");
    assert_eq!(some.bytes()?, &[] as &[u8]);
    Ok(())
}

#[test]
fn test_nested_list_iteration() -> Result<()> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    for name in ["a", "b", "c"] {
        enc.list_begin()?;
        enc.str(name)?;
        enc.list_end()?;
    }
    enc.list_end()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    let mut outer = dec.list()?;

    let mut seen = Vec::new();
    while let Some(mut item) = outer.next()? {
        let mut inner = item.list()?;
        let mut s = inner.next()?.expect("one string per inner list");
        seen.push(s.str()?.to_string());
        assert!(inner.next()?.is_none());
    }
    assert_eq!(seen, ["a", "b", "c"]);
    Ok(())
}

#[test]
fn test_map_rejects_non_variant() {
    let mut enc = Encoder::new();
    enc.map_begin().unwrap();
    assert_eq!(enc.u64(1), Err(Error::InvalidMapEntry));
}

#[test]
fn test_variant_requires_exactly_one_item() {
    let mut enc = Encoder::new();
    enc.variant_begin("Close").unwrap();
    assert_eq!(enc.variant_end(), Err(Error::EmptyScope(Scope::Variant)));

    let mut enc = Encoder::new();
    enc.variant_begin("Close").unwrap();
    enc.unit().unwrap();
    assert_eq!(enc.unit(), Err(Error::TooManyItems(Scope::Variant)));
}

#[test]
fn test_scope_errors() {
    let mut enc = Encoder::new();
    assert_eq!(enc.list_end(), Err(Error::ScopeUnderflow));

    enc.list_begin().unwrap();
    assert_eq!(
        enc.map_end(),
        Err(Error::ScopeMismatch { expected: Scope::Map, actual: Scope::List })
    );
    assert!(matches!(enc.into_bytes(), Err(Error::ScopeStillOpen)));
}

#[test]
fn test_truncated_input() {
    let mut enc = Encoder::new();
    enc.str("truncate me").unwrap();
    let bytes = enc.into_bytes().unwrap();

    let mut dec = Decoder::new(&bytes[..bytes.len() - 3]);
    assert_eq!(dec.str(), Err(Error::UnexpectedEnd));
}

#[test]
fn test_invalid_and_unexpected_tags() {
    let dec = Decoder::new(&[0xFF]);
    assert_eq!(dec.peek_tag(), Err(Error::InvalidTag(0xFF)));

    let mut enc = Encoder::new();
    enc.u64(3).unwrap();
    let bytes = enc.into_bytes().unwrap();
    let mut dec = Decoder::new(&bytes);
    assert_eq!(
        dec.str(),
        Err(Error::UnexpectedTag { expected: Tag::String, found: Tag::U64 })
    );
}

#[test]
fn test_invalid_utf8() {
    let mut enc = Encoder::new();
    enc.bytes(&[0xC3, 0x28]).unwrap();
    let mut bytes = enc.into_bytes().unwrap();
    bytes[0] = Tag::String as u8;

    let mut dec = Decoder::new(&bytes);
    assert_eq!(dec.str(), Err(Error::InvalidUtf8));
}
