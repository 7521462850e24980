use serde_json::{Map, Value};

use crate::models::{ArtifactEvent, ProvenanceInfo};

/// Map a completed tool result onto the same artifact shape inline markers
/// produce. `provenance.source_tool` is replaced with `tool_name`.
///
/// A result that already looks like an artifact (`artifactType`/`type` plus an
/// object `payload`/`data`) keeps its own type. Anything else becomes an
/// artifact typed after the tool, with non-object results wrapped as
/// `{"value": ...}` so payloads are always JSON objects.
pub fn normalize(tool_name: &str, raw_result: Value, provenance: ProvenanceInfo) -> ArtifactEvent {
    let metadata = ProvenanceInfo {
        source_tool: tool_name.to_string(),
        ..provenance
    };

    let (artifact_type, payload) = match raw_result {
        Value::Object(mut fields) => match split_artifact(&mut fields) {
            Some(parts) => parts,
            None => (tool_name.to_string(), Value::Object(fields)),
        },
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("value".to_string(), other);
            (tool_name.to_string(), Value::Object(wrapped))
        }
    };

    ArtifactEvent {
        artifact_type,
        payload,
        metadata,
    }
}

fn split_artifact(fields: &mut Map<String, Value>) -> Option<(String, Value)> {
    let type_key = ["artifactType", "type"]
        .into_iter()
        .find(|key| fields.get(*key).is_some_and(Value::is_string))?;
    let payload_key = ["payload", "data"]
        .into_iter()
        .find(|key| fields.get(*key).is_some_and(Value::is_object))?;

    let artifact_type = fields.remove(type_key)?.as_str()?.to_string();
    let payload = fields.remove(payload_key)?;
    Some((artifact_type, payload))
}
