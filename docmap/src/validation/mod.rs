use crate::error::{DocMapError, Result};
use crate::record::{Record, Value};
use crate::schema::{BaseType, FieldDescriptor, Modifier, ModifierKind, RecordSchema, ScalarType};
use crate::transform;

/// Store round-trip used by the `Unique` checker.
pub trait UniqueProbe {
    /// True when a stored record of `schema`, other than `exclude_id`, already
    /// holds `value` in `field`.
    fn exists(
        &self,
        schema: &RecordSchema,
        field: &str,
        value: &serde_json::Value,
        exclude_id: Option<&str>,
    ) -> Result<bool>;
}

/// Check that `value` fits the field's base type. Null always passes here;
/// `NonNull` is enforced at save time.
pub fn check_type(owner: &RecordSchema, field: &FieldDescriptor, value: &Value) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }

    if field.is_list() {
        let items = value
            .as_list()
            .ok_or_else(|| mismatch(owner, field, value))?;
        for item in items {
            if !element_matches(field, item) {
                return Err(DocMapError::TypeMismatch {
                    record: owner.name().to_string(),
                    field: field.name.clone(),
                    expected: field.type_label(),
                    found: format!("list containing {}", item.kind_name()),
                });
            }
        }
        return Ok(());
    }

    if element_matches(field, value) {
        Ok(())
    } else {
        Err(mismatch(owner, field, value))
    }
}

fn element_matches(field: &FieldDescriptor, value: &Value) -> bool {
    match (&field.base, value) {
        (BaseType::Scalar(ScalarType::String), Value::String(_)) => true,
        (BaseType::Scalar(ScalarType::Int), Value::Int(_)) => true,
        (BaseType::Scalar(ScalarType::Float), Value::Float(_) | Value::Int(_)) => true,
        (BaseType::Scalar(ScalarType::Bool), Value::Bool(_)) => true,
        (BaseType::Scalar(ScalarType::DateTime), Value::DateTime(_)) => true,
        (BaseType::Scalar(ScalarType::Json), Value::Json(_)) => true,
        (BaseType::Record(target), Value::Record(record)) => record.type_name() == target,
        // a linked field may hold the target's id instead of the record
        (BaseType::Record(_), Value::String(_)) => field.is_linked(),
        _ => false,
    }
}

fn mismatch(owner: &RecordSchema, field: &FieldDescriptor, value: &Value) -> DocMapError {
    DocMapError::TypeMismatch {
        record: owner.name().to_string(),
        field: field.name.clone(),
        expected: field.type_label(),
        found: value.kind_name(),
    }
}

/// Full pre-persistence validation of a record: per field, the type check and
/// then every checker modifier in declaration order.
pub fn validate_for_save(record: &Record, probe: &dyn UniqueProbe) -> Result<()> {
    let owner = record.schema();
    for (field, value) in record.fields() {
        check_type(owner, field, value)?;
        for modifier in &field.modifiers {
            if modifier.kind() == ModifierKind::Checker {
                run_checker(*modifier, record, field, value, probe)?;
            }
        }
    }
    Ok(())
}

fn run_checker(
    modifier: Modifier,
    record: &Record,
    field: &FieldDescriptor,
    value: &Value,
    probe: &dyn UniqueProbe,
) -> Result<()> {
    match modifier {
        Modifier::NonNull => {
            if value.is_null() {
                return Err(DocMapError::NullValue {
                    record: record.type_name().to_string(),
                    field: field.name.clone(),
                });
            }
        }
        Modifier::Unique => {
            if value.is_null() {
                return Ok(());
            }
            let stored = transform::encode_field(record.schema(), field, value)?;
            if probe.exists(record.schema(), &field.name, &stored, record.id())? {
                return Err(DocMapError::Uniqueness {
                    collection: record.collection().to_string(),
                    field: field.name.clone(),
                });
            }
        }
        Modifier::Linked | Modifier::Cascade | Modifier::List => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use chrono::Utc;
    use serde_json::json;
    use std::cell::RefCell;

    fn test_schema() -> Schema {
        Schema::from_yaml_str(
            r#"
records:
  User:
    fields:
      username: { type: string, modifiers: [unique, non_null] }
      email: { type: string, modifiers: [non_null] }
      age: { type: int }
      ratio: { type: float }
      active: { type: bool }
      seen: { type: datetime }
      extra: { type: json }
      scores: { type: int, modifiers: [list] }
  Project:
    fields:
      owner: { type: User, modifiers: [linked] }
      reviewer: { type: User }
"#,
        )
        .unwrap()
    }

    /// Probe that records calls and reports a clash for one value.
    struct FakeProbe {
        taken: serde_json::Value,
        calls: RefCell<Vec<(String, Option<String>)>>,
    }

    impl FakeProbe {
        fn new(taken: serde_json::Value) -> Self {
            FakeProbe {
                taken,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl UniqueProbe for FakeProbe {
        fn exists(
            &self,
            _schema: &RecordSchema,
            field: &str,
            value: &serde_json::Value,
            exclude_id: Option<&str>,
        ) -> Result<bool> {
            self.calls
                .borrow_mut()
                .push((field.to_string(), exclude_id.map(str::to_string)));
            Ok(*value == self.taken)
        }
    }

    fn descriptor<'a>(schema: &'a Schema, record: &str, field: &str) -> (&'a RecordSchema, &'a FieldDescriptor) {
        let owner = schema.get(record).unwrap();
        (owner.as_ref(), owner.field(field).unwrap())
    }

    #[test]
    fn test_valid_assignments_accepted() {
        let schema = test_schema();
        let cases: Vec<(&str, Value)> = vec![
            ("username", "alice".into()),
            ("age", 3.into()),
            ("ratio", 0.5.into()),
            ("ratio", 2.into()),
            ("active", true.into()),
            ("seen", Utc::now().into()),
            ("extra", json!({"k": [1, 2]}).into()),
            ("scores", vec![1, 2, 3].into()),
            ("scores", Value::List(Vec::new())),
            ("age", Value::Null),
        ];
        for (field, value) in cases {
            let (owner, desc) = descriptor(&schema, "User", field);
            assert!(check_type(owner, desc, &value).is_ok(), "{field} = {value:?}");
        }
    }

    #[test]
    fn test_mismatches_rejected() {
        let schema = test_schema();
        let cases: Vec<(&str, Value)> = vec![
            ("username", 1.into()),
            ("age", 1.5.into()),
            ("age", "3".into()),
            ("active", "yes".into()),
            ("seen", "2026-01-01".into()),
            ("extra", "raw".into()),
            ("scores", 1.into()),
            ("scores", vec![Value::Int(1), Value::String("2".into())].into()),
        ];
        for (field, value) in cases {
            let (owner, desc) = descriptor(&schema, "User", field);
            let err = check_type(owner, desc, &value).unwrap_err();
            assert!(matches!(err, DocMapError::TypeMismatch { .. }), "{field} = {value:?}");
        }
    }

    #[test]
    fn test_record_fields() {
        let schema = test_schema();
        let user = schema.record("User").unwrap().build().unwrap();
        let project = schema.record("Project").unwrap().build().unwrap();

        let (owner, linked) = descriptor(&schema, "Project", "owner");
        assert!(check_type(owner, linked, &user.clone().into()).is_ok());
        assert!(check_type(owner, linked, &"an-id".into()).is_ok());
        assert!(check_type(owner, linked, &project.clone().into()).is_err());

        let (owner, embedded) = descriptor(&schema, "Project", "reviewer");
        assert!(check_type(owner, embedded, &user.into()).is_ok());
        assert!(check_type(owner, embedded, &"an-id".into()).is_err());
    }

    #[test]
    fn test_non_null_enforced_at_save() {
        let schema = test_schema();
        let user = schema
            .record("User")
            .unwrap()
            .field("username", "alice")
            .build()
            .unwrap();

        let err = validate_for_save(&user, &FakeProbe::new(json!(null))).unwrap_err();
        assert!(matches!(err, DocMapError::NullValue { ref field, .. } if field == "email"));
    }

    #[test]
    fn test_unique_uses_probe() {
        let schema = test_schema();
        let user = schema
            .record("User")
            .unwrap()
            .id("u1")
            .field("username", "dup")
            .field("email", "dup@example.com")
            .build()
            .unwrap();

        let probe = FakeProbe::new(json!("dup"));
        let err = validate_for_save(&user, &probe).unwrap_err();
        assert!(matches!(err, DocMapError::Uniqueness { ref field, .. } if field == "username"));
        assert_eq!(
            probe.calls.borrow().as_slice(),
            &[("username".to_string(), Some("u1".to_string()))]
        );

        let probe = FakeProbe::new(json!("someone-else"));
        assert!(validate_for_save(&user, &probe).is_ok());
    }

    #[test]
    fn test_null_value_skips_uniqueness_probe() {
        let schema = Schema::from_yaml_str(
            "records:\n  Tag:\n    fields:\n      slug: { type: string, modifiers: [unique] }\n",
        )
        .unwrap();
        let tag = schema.record("Tag").unwrap().build().unwrap();
        let probe = FakeProbe::new(json!(null));
        assert!(validate_for_save(&tag, &probe).is_ok());
        assert!(probe.calls.borrow().is_empty());
    }
}
