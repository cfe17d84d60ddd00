use blueprint::{
    compatible, sub_field, template_field, Arguments, BlueprintError, BoxError, Config, Field,
    Tag, Target, Value,
};

fn point_target() -> blueprint::Result<Target> {
    Target::builder("Point")
        .field(Field::with_default("name", Value::None))
        .field(Field::required("x"))
        .field(Field::with_default("y", 0i64))
        .build(|args: &Arguments| -> Result<Value, BoxError> {
            let x: i64 = args.get("x")?;
            let y: i64 = args.get("y")?;
            Ok(Value::Int(x * 10 + y))
        })
}

fn outer_target() -> blueprint::Result<Target> {
    Target::builder("Outer")
        .field(Field::with_default("name", Value::None))
        .field(sub_field("child", point_target()?))
        .field(template_field("tpl", Some(point_target()?)))
        .build(|args: &Arguments| Ok(args.value("child").cloned().unwrap_or_default()))
}

#[test]
fn unset_fields_read_their_defaults() -> anyhow::Result<()> {
    let cfg = Config::new(point_target()?);
    assert_eq!(cfg.get("y")?, Value::Int(0));
    assert!(matches!(
        cfg.get("x"),
        Err(BlueprintError::MissingArgument { .. })
    ));
    assert!(matches!(
        cfg.get("z"),
        Err(BlueprintError::UnknownField { .. })
    ));
    Ok(())
}

#[test]
fn clones_do_not_share_edits() -> anyhow::Result<()> {
    let mut a = Config::new(outer_target()?);
    let mut child = Config::new(point_target()?);
    child.set("x", 1i64)?;
    a.set("child", child)?;

    let mut b = a.clone();
    if let Some(Value::Config(inner)) = b.explicit_mut("child") {
        inner.set("x", 2i64)?;
    }
    assert_eq!(a.get("child")?.as_config().map(|c| c.get("x").ok()), Some(Some(Value::Int(1))));
    assert_eq!(b.get("child")?.as_config().map(|c| c.get("x").ok()), Some(Some(Value::Int(2))));
    Ok(())
}

#[test]
fn factory_defaults_are_fresh_per_read() -> anyhow::Result<()> {
    let cfg = Config::new(outer_target()?);
    let first = cfg.get_as::<Config>("child")?;
    let second = cfg.get_as::<Config>("child")?;
    assert_eq!(first, second);
    assert_ne!(first.node_id(), second.node_id());
    Ok(())
}

#[test]
fn compatible_ignores_names_only() -> anyhow::Result<()> {
    let mut a = Config::new(point_target()?);
    a.set("x", 3i64)?.set("name", "left")?;
    let mut b = a.clone();
    b.set("name", "right")?;
    assert!(compatible(&a, &b));

    b.set("y", 1i64)?;
    assert!(!compatible(&a, &b));
    Ok(())
}

#[test]
fn copy_fields_from_copies_values_and_resets_shared_factories() -> anyhow::Result<()> {
    let mut source = Config::new(outer_target()?);
    source.set("name", "src")?;
    let mut dest = Config::new(outer_target()?);
    dest.set("child", Config::new(point_target()?).with("x", 9i64)?)?;

    dest.copy_fields_from(&source, &[])?;
    // Same factory on both sides: the destination falls back to its default.
    assert!(!dest.has_argument("child"));
    // Names are never copied.
    assert_eq!(dest.get("name")?, Value::None);
    Ok(())
}

#[test]
fn copy_fields_from_rejects_unknown_source_fields() -> anyhow::Result<()> {
    let source = Config::new(outer_target()?);
    let mut dest = Config::new(point_target()?);
    let err = dest.copy_fields_from(&source, &[]).err();
    assert!(matches!(err, Some(BlueprintError::IncompatibleCopy { .. })));

    // Explicitly allowed missing fields are skipped; a required `x` on the
    // source is never consulted because `Outer` has no `x`.
    let mut dest = Config::new(point_target()?);
    dest.copy_fields_from(&source, &["child", "tpl"])?;
    Ok(())
}

#[test]
fn copy_fields_from_rejects_missing_required_values() -> anyhow::Result<()> {
    let source = Config::new(point_target()?);
    let mut dest = Config::new(point_target()?);
    let err = dest.copy_fields_from(&source, &[]).err();
    assert!(matches!(err, Some(BlueprintError::MissingRequiredCopy { .. })));
    Ok(())
}

#[test]
fn tags_merge_schema_and_config_tags() -> anyhow::Result<()> {
    const MARK: Tag = Tag::new("Mark");
    let mut cfg = Config::new(outer_target()?);
    assert!(cfg.has_tag("tpl", blueprint::DO_NOT_BUILD));
    assert!(!cfg.has_tag("child", MARK));
    cfg.add_tag("child", MARK)?;
    assert!(cfg.has_tag("child", MARK));
    assert!(cfg.add_tag("missing", MARK).is_err());
    Ok(())
}

#[test]
fn to_text_names_the_target() -> anyhow::Result<()> {
    let cfg = Config::new(point_target()?).with("x", 4i64)?;
    let text = cfg.to_text();
    assert!(text.contains("\"__fn_or_cls__\": \"Point\""));
    assert!(text.contains("\"x\": 4"));
    Ok(())
}
