//! Schema-aware mutations: typed, byte-budgeted, and aware of fields that
//! must be carried over from earlier messages.

pub mod interesting;

use bytes::Bytes;
use log::debug;
use prost::Message;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, ReflectMessage, Value};

use crate::{
    analysis::ValueRelation,
    bolts::rands::Rand,
    mutators::interesting::{
        INTERESTING_F32, INTERESTING_F64, INTERESTING_I32, INTERESTING_I64, INTERESTING_U32,
        INTERESTING_U64,
    },
    Error,
};

/// Protobuf caps string/bytes fields at 2^32 bytes.
const FIELD_HARD_CAP: usize = u32::MAX as usize;

/// How many times a random field pick is re-rolled before giving up on
/// finding a mutable field.
const PICK_RETRIES: usize = 10;

/// How a message is mutated per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationMode {
    /// One randomly chosen field
    SingleField,
    /// Every mutable field
    WholeMessage,
}

/// The schema-typed mutator.
///
/// Works in place on a decoded message; the wire payload is re-serialized
/// from it after every call, and never exceeds the configured budget.
#[derive(Debug, Default)]
pub struct SchemaMutator;

impl SchemaMutator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Mutates `msg` and rewrites `payload` with its new serialization.
    ///
    /// Fields named in `ignored` are never touched. If `relations` name
    /// this message's type, the related field values are first copied out
    /// of `dep_messages` and pinned for the rest of the call.
    #[allow(clippy::too_many_arguments)]
    pub fn mutate<R: Rand>(
        &self,
        msg: &mut DynamicMessage,
        payload: &mut Vec<u8>,
        mode: MutationMode,
        ignored: &[String],
        max_msg_size: usize,
        rand: &mut R,
        relations: &[ValueRelation],
        dep_messages: &[DynamicMessage],
    ) -> Result<(), Error> {
        let pinned = apply_dependencies(msg, relations, dep_messages)?;

        let fields: Vec<FieldDescriptor> = msg.descriptor().fields().collect();
        if fields.is_empty() {
            *payload = msg.encode_to_vec();
            return Ok(());
        }

        match mode {
            MutationMode::SingleField => {
                let mut idx = rand.below(fields.len() as u64) as usize;
                for _ in 0..PICK_RETRIES {
                    if is_field_ignored(fields[idx].name(), ignored, &pinned) {
                        idx = rand.below(fields.len() as u64) as usize;
                    } else {
                        break;
                    }
                }
                // Still stuck on an untouchable field: hand back the
                // current serialization unchanged.
                if is_field_ignored(fields[idx].name(), ignored, &pinned) {
                    *payload = msg.encode_to_vec();
                    return Ok(());
                }
                mutate_field(&fields[idx], msg, max_msg_size, rand)?;
            }
            MutationMode::WholeMessage => {
                for field in &fields {
                    if is_field_ignored(field.name(), ignored, &pinned) {
                        continue;
                    }
                    mutate_field(field, msg, max_msg_size, rand)?;
                }
            }
        }

        *payload = msg.encode_to_vec();
        Ok(())
    }
}

/// Copies every related field value out of the dependency messages,
/// returning the names now pinned for this call.
fn apply_dependencies(
    msg: &mut DynamicMessage,
    relations: &[ValueRelation],
    dep_messages: &[DynamicMessage],
) -> Result<Vec<String>, Error> {
    let own_name = msg.descriptor().full_name().to_string();
    let own_prefix = format!("{own_name}.");
    let mut pinned = Vec::new();

    for relation in relations.iter().filter(|rel| rel.msg2 == own_name) {
        for dep in dep_messages
            .iter()
            .filter(|dep| dep.descriptor().full_name() == relation.msg1)
        {
            for (src_name, dst_name) in &relation.field_pairs {
                // Only top-level fields of this message can be pinned;
                // pairs found inside sub-messages carry the sub-message
                // type's prefix and fall through here.
                let Some(dst_field_name) = dst_name.strip_prefix(&own_prefix) else {
                    continue;
                };
                let src_prefix = format!("{}.", relation.msg1);
                let Some(src_field_name) = src_name.strip_prefix(&src_prefix) else {
                    continue;
                };
                let (Some(dst_field), Some(src_field)) = (
                    msg.descriptor().get_field_by_name(dst_field_name),
                    dep.descriptor().get_field_by_name(src_field_name),
                ) else {
                    continue;
                };

                let value = dep.get_field(&src_field).into_owned();
                debug!("pinning {dst_field_name} from {}", relation.msg1);
                msg.try_set_field(&dst_field, value)
                    .map_err(|_| Error::MutationFailed(dst_field_name.to_string()))?;
                pinned.push(dst_field_name.to_string());
            }
        }
    }

    Ok(pinned)
}

/// Full-membership check against the ignore and pin lists.
fn is_field_ignored(name: &str, ignored: &[String], pinned: &[String]) -> bool {
    ignored.iter().chain(pinned.iter()).any(|field| field == name)
}

/// Mutates one field in place, budget-aware.
fn mutate_field<R: Rand>(
    field: &FieldDescriptor,
    msg: &mut DynamicMessage,
    max_msg_size: usize,
    rand: &mut R,
) -> Result<(), Error> {
    if field.is_map() {
        // Map fields keep their captured shape.
        return Ok(());
    }

    let cur_size = msg.encoded_len();

    if field.is_list() {
        // The repetition count stays as captured; one element is mutated
        // through its element kind.
        let Value::List(mut list) = msg.get_field(field).into_owned() else {
            return Ok(());
        };
        if list.is_empty() {
            return Ok(());
        }
        let idx = rand.below(list.len() as u64) as usize;
        let new_val = mutate_value(&list[idx], &field.kind(), cur_size, max_msg_size, rand)?;
        list[idx] = new_val;
        return msg
            .try_set_field(field, Value::List(list))
            .map_err(|_| Error::MutationFailed(field.name().to_string()));
    }

    let current = msg.get_field(field).into_owned();
    let new_val = mutate_value(&current, &field.kind(), cur_size, max_msg_size, rand)?;
    msg.try_set_field(field, new_val)
        .map_err(|_| Error::MutationFailed(field.name().to_string()))
}

/// Produces the mutated replacement for one value of the given kind.
fn mutate_value<R: Rand>(
    current: &Value,
    kind: &Kind,
    cur_size: usize,
    max_msg_size: usize,
    rand: &mut R,
) -> Result<Value, Error> {
    let val = match kind {
        Kind::Bool => Value::Bool(rand.next() % 2 == 0),
        Kind::Float => Value::F32(*rand.choose(&INTERESTING_F32)),
        Kind::Double => Value::F64(*rand.choose(&INTERESTING_F64)),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => Value::I32(*rand.choose(&INTERESTING_I32)),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => Value::I64(*rand.choose(&INTERESTING_I64)),
        Kind::Uint32 | Kind::Fixed32 => Value::U32(*rand.choose(&INTERESTING_U32)),
        Kind::Uint64 | Kind::Fixed64 => Value::U64(*rand.choose(&INTERESTING_U64)),
        Kind::String => {
            let cur = current.as_str().unwrap_or_default();
            match repeat_within_budget(cur.len(), cur_size, max_msg_size, rand) {
                Repeat::Times(k) => {
                    let candidate = cur.repeat(k);
                    if candidate.len() > FIELD_HARD_CAP {
                        Value::String(String::new())
                    } else {
                        Value::String(candidate)
                    }
                }
                Repeat::Reset => Value::String("A".to_string()),
            }
        }
        Kind::Bytes => {
            let cur: &[u8] = current.as_bytes().map(|b| b.as_ref()).unwrap_or_default();
            match repeat_within_budget(cur.len(), cur_size, max_msg_size, rand) {
                Repeat::Times(k) => {
                    let candidate = cur.repeat(k);
                    if candidate.len() > FIELD_HARD_CAP {
                        Value::Bytes(Bytes::from_static(&[0x01]))
                    } else {
                        Value::Bytes(Bytes::from(candidate))
                    }
                }
                Repeat::Reset => Value::Bytes(Bytes::from_static(&[0x01])),
            }
        }
        Kind::Enum(enum_desc) => {
            let values: Vec<i32> = enum_desc.values().map(|v| v.number()).collect();
            Value::EnumNumber(values[rand.below(values.len() as u64) as usize])
        }
        Kind::Message(desc) => {
            let mut nested = match current.as_message() {
                Some(nested) => nested.clone(),
                None => DynamicMessage::new(desc.clone()),
            };
            // The sub-message budget is what the whole message leaves it:
            // everything serialized outside it still counts.
            let overhead = cur_size.saturating_sub(nested.encoded_len());
            let nested_budget = max_msg_size.saturating_sub(overhead);
            for sub_field in desc.fields().collect::<Vec<_>>() {
                mutate_field(&sub_field, &mut nested, nested_budget, rand)?;
            }
            Value::Message(nested)
        }
    };
    Ok(val)
}

enum Repeat {
    Times(usize),
    Reset,
}

/// Picks a repeat factor for a string/bytes field that keeps the message
/// under budget, or decides the field has to be reset to its sentinel.
fn repeat_within_budget<R: Rand>(
    field_len: usize,
    cur_size: usize,
    max_msg_size: usize,
    rand: &mut R,
) -> Repeat {
    let available = max_msg_size.saturating_sub(cur_size);
    let mut k = rand.below(10) as usize;
    if k == 0 {
        k = 1;
    }

    if field_len * k > available {
        // Shrink towards a factor that still fits.
        match (1..=k).rev().find(|i| field_len * i <= available) {
            Some(fit) => Repeat::Times(fit),
            None => Repeat::Reset,
        }
    } else {
        Repeat::Times(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ValueRelation;
    use crate::bolts::rands::{FixedRand, StdRand};
    use crate::schema::testutil::compile_schema;
    use indexmap::IndexMap;

    const KINDS_PROTO: &str = r#"
syntax = "proto3";
package pkg;

enum Mood {
  MOOD_UNSET = 0;
  MOOD_GOOD = 1;
  MOOD_BAD = 2;
}

message Inner {
  string token = 1;
}

message Everything {
  string name = 1;
  bool flag = 2;
  int32 count = 3;
  uint64 big = 4;
  double ratio = 5;
  bytes blob = 6;
  Mood mood = 7;
  Inner inner = 8;
  repeated int32 scores = 9;
}

message UseFooRequest {
  string id = 1;
  int32 count = 2;
}

message CreateFooReply {
  string id = 1;
}

service Svc {
  rpc Do(Everything) returns (Everything);
}
"#;

    fn build(
        schemas: &crate::schema::SchemaSet,
        name: &str,
        fields: &[(&str, Value)],
    ) -> DynamicMessage {
        let desc = schemas.message_by_name(name).unwrap();
        let mut msg = DynamicMessage::new(desc.clone());
        for (field, value) in fields {
            let fd = desc.get_field_by_name(field).unwrap();
            msg.set_field(&fd, value.clone());
        }
        msg
    }

    #[test]
    fn oversized_string_is_reset_to_sentinel() {
        let schemas = compile_schema(KINDS_PROTO);
        let mut msg = build(
            &schemas,
            "pkg.Everything",
            &[("name", Value::String("A".repeat(50)))],
        );
        let mut payload = msg.encode_to_vec();
        assert_eq!(payload.len(), 52);

        // Field pick lands on `name`, repeat factor rolls high.
        let mut rand = FixedRand::new(vec![0, 9]);
        SchemaMutator::new()
            .mutate(
                &mut msg,
                &mut payload,
                MutationMode::SingleField,
                &[],
                60,
                &mut rand,
                &[],
                &[],
            )
            .unwrap();

        let name = schemas
            .message_by_name("pkg.Everything")
            .unwrap()
            .get_field_by_name("name")
            .unwrap();
        assert_eq!(msg.get_field(&name).as_str(), Some("A"));
        assert!(payload.len() <= 60);
    }

    #[test]
    fn repeat_factor_zero_clamps_to_one() {
        let mut rand = FixedRand::new(vec![10]); // below(10) -> 0
        match repeat_within_budget(3, 10, 100, &mut rand) {
            Repeat::Times(k) => assert_eq!(k, 1),
            Repeat::Reset => panic!("unexpected reset"),
        }
    }

    #[test]
    fn fully_pinned_message_comes_back_unchanged() {
        let schemas = compile_schema(KINDS_PROTO);
        let mut msg = build(
            &schemas,
            "pkg.Everything",
            &[("name", Value::String("keep".into()))],
        );
        let original = msg.encode_to_vec();
        let mut payload = original.clone();

        let ignored: Vec<String> = schemas
            .message_by_name("pkg.Everything")
            .unwrap()
            .fields()
            .map(|f| f.name().to_string())
            .collect();

        let mut rand = StdRand::with_seed(7);
        SchemaMutator::new()
            .mutate(
                &mut msg,
                &mut payload,
                MutationMode::SingleField,
                &ignored,
                1024,
                &mut rand,
                &[],
                &[],
            )
            .unwrap();
        assert_eq!(payload, original);
    }

    #[test]
    fn selection_stuck_on_a_pinned_field_returns_the_bytes_unchanged() {
        let schemas = compile_schema(KINDS_PROTO);
        let dep = build(
            &schemas,
            "pkg.CreateFooReply",
            &[("id", Value::String("xyz".into()))],
        );
        let mut msg = build(
            &schemas,
            "pkg.UseFooRequest",
            &[("id", Value::String("xyz".into())), ("count", Value::I32(7))],
        );
        let original = msg.encode_to_vec();
        let mut payload = original.clone();

        let mut field_pairs = IndexMap::new();
        field_pairs.insert(
            "pkg.CreateFooReply.id".to_string(),
            "pkg.UseFooRequest.id".to_string(),
        );
        let relations = vec![ValueRelation {
            msg1: "pkg.CreateFooReply".into(),
            msg2: "pkg.UseFooRequest".into(),
            field_pairs,
        }];

        // Every roll lands on the pinned `id`; after ten retries the
        // mutator gives up and re-serializes as-is.
        let mut rand = FixedRand::new(vec![0]);
        SchemaMutator::new()
            .mutate(
                &mut msg,
                &mut payload,
                MutationMode::SingleField,
                &[],
                1024,
                &mut rand,
                &relations,
                &[dep],
            )
            .unwrap();
        assert_eq!(payload, original);
    }

    #[test]
    fn dependency_fields_are_copied_and_never_mutated() {
        let schemas = compile_schema(KINDS_PROTO);
        let dep = build(
            &schemas,
            "pkg.CreateFooReply",
            &[("id", Value::String("xyz".into()))],
        );
        let mut msg = build(
            &schemas,
            "pkg.UseFooRequest",
            &[("id", Value::String("stale".into())), ("count", Value::I32(1))],
        );
        let mut payload = msg.encode_to_vec();

        let mut field_pairs = IndexMap::new();
        field_pairs.insert(
            "pkg.CreateFooReply.id".to_string(),
            "pkg.UseFooRequest.id".to_string(),
        );
        let relations = vec![ValueRelation {
            msg1: "pkg.CreateFooReply".into(),
            msg2: "pkg.UseFooRequest".into(),
            field_pairs,
        }];

        let mut rand = StdRand::with_seed(99);
        SchemaMutator::new()
            .mutate(
                &mut msg,
                &mut payload,
                MutationMode::WholeMessage,
                &[],
                1024,
                &mut rand,
                &relations,
                &[dep.clone()],
            )
            .unwrap();

        let desc = schemas.message_by_name("pkg.UseFooRequest").unwrap();
        let id = desc.get_field_by_name("id").unwrap();
        let count = desc.get_field_by_name("count").unwrap();
        // The pinned value survives bit-for-bit, the free field moved to
        // an interesting value.
        assert_eq!(msg.get_field(&id).as_str(), Some("xyz"));
        assert!(INTERESTING_I32.contains(&msg.get_field(&count).as_i32().unwrap()));

        let decoded = DynamicMessage::decode(desc, payload.as_slice()).unwrap();
        assert_eq!(decoded.get_field(&id).as_str(), Some("xyz"));
    }

    #[test]
    fn whole_message_stays_within_budget_and_reserializes() {
        let schemas = compile_schema(KINDS_PROTO);
        let desc = schemas.message_by_name("pkg.Everything").unwrap();
        let mut msg = build(
            &schemas,
            "pkg.Everything",
            &[
                ("name", Value::String("seed".into())),
                ("count", Value::I32(7)),
                ("blob", Value::Bytes(Bytes::from_static(b"\x01\x02"))),
                ("scores", Value::List(vec![Value::I32(1), Value::I32(2)])),
                (
                    "inner",
                    Value::Message(build(
                        &schemas,
                        "pkg.Inner",
                        &[("token", Value::String("tok".into()))],
                    )),
                ),
            ],
        );
        let mut payload = msg.encode_to_vec();

        let mut rand = StdRand::with_seed(3);
        for _ in 0..50 {
            SchemaMutator::new()
                .mutate(
                    &mut msg,
                    &mut payload,
                    MutationMode::WholeMessage,
                    &[],
                    256,
                    &mut rand,
                    &[],
                    &[],
                )
                .unwrap();
            assert!(payload.len() <= 256, "payload {} over budget", payload.len());
            // The serialized form always reflects the parsed form.
            let decoded = DynamicMessage::decode(desc.clone(), payload.as_slice()).unwrap();
            assert_eq!(decoded, msg);
        }

        // Repeated field: element count untouched.
        let scores = desc.get_field_by_name("scores").unwrap();
        match msg.get_field(&scores).as_ref() {
            Value::List(list) => assert_eq!(list.len(), 2),
            other => panic!("scores should stay a list, got {other:?}"),
        }
    }

    #[test]
    fn enum_mutation_picks_declared_values_only() {
        let schemas = compile_schema(KINDS_PROTO);
        let desc = schemas.message_by_name("pkg.Everything").unwrap();
        let mood = desc.get_field_by_name("mood").unwrap();
        let mut rand = StdRand::with_seed(11);
        for _ in 0..64 {
            let mut msg = build(&schemas, "pkg.Everything", &[]);
            let mut payload = Vec::new();
            SchemaMutator::new()
                .mutate(
                    &mut msg,
                    &mut payload,
                    MutationMode::WholeMessage,
                    &["name", "flag", "count", "big", "ratio", "blob", "inner", "scores"]
                        .map(String::from),
                    1024,
                    &mut rand,
                    &[],
                    &[],
                )
                .unwrap();
            let value = msg.get_field(&mood).as_enum_number().unwrap();
            assert!((0..=2).contains(&value));
        }
    }
}
