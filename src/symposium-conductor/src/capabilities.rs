//! Capability negotiation across the chain.
//!
//! The editor's `initialize` travels down the chain like any other request,
//! but the conductor tags it on the way: proxy positions see
//! `_meta.symposium.role = "orchestrator"` and must answer with
//! `_meta.symposium.role = "proxy"`, while the agent gets a plain
//! `initialize` with every `_meta.symposium` field removed. Every response
//! is recorded as it passes, and once link 0 answers the negotiator
//! settles, decides which adaptations the chain needs, and produces the
//! response the editor is allowed to see.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConductorError;
use crate::jsonrpc::Message;

pub const META: &str = "_meta";
pub const SYMPOSIUM: &str = "symposium";

/// Internal flag: the link can pre-populate a session with earlier history.
pub const SESSION_HISTORY: &str = "session_history";
/// Internal flag: the link speaks MCP over ACP natively.
pub const MCP_ACP_TRANSPORT: &str = "mcp_acp_transport";

/// Feature paths that only matter inside the chain.
const INTERNAL_FEATURES: &[&str] = &["mcpCapabilities.acp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Orchestrator,
    Proxy,
}

/// What one link declared in its `initialize` response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityRecord {
    pub version: Option<String>,
    pub role: Option<Role>,
    /// Boolean leaves of `agentCapabilities`, keyed by dotted path.
    pub features: BTreeMap<String, bool>,
    /// Flags under `_meta.symposium.features`.
    pub internal: BTreeMap<String, bool>,
}

impl CapabilityRecord {
    pub fn from_initialize_result(result: &Value) -> Self {
        let version = result.get("protocolVersion").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

        let symposium = result.get(META).and_then(|meta| meta.get(SYMPOSIUM));
        let role = symposium
            .and_then(|s| s.get("role"))
            .and_then(|role| serde_json::from_value(role.clone()).ok());

        let mut internal = BTreeMap::new();
        match symposium.and_then(|s| s.get("features")) {
            Some(Value::Object(flags)) => {
                for (name, value) in flags {
                    if let Some(flag) = value.as_bool() {
                        internal.insert(name.clone(), flag);
                    }
                }
            }
            Some(Value::Array(names)) => {
                for name in names.iter().filter_map(Value::as_str) {
                    internal.insert(name.to_string(), true);
                }
            }
            _ => {}
        }

        let mut features = BTreeMap::new();
        if let Some(capabilities) = result.get("agentCapabilities") {
            flatten(capabilities, String::new(), &mut features);
        }

        CapabilityRecord {
            version,
            role,
            features,
            internal,
        }
    }

    pub fn supports(&self, path: &str) -> bool {
        self.features.get(path).copied().unwrap_or(false)
    }

    pub fn has_internal(&self, name: &str) -> bool {
        self.internal.get(name).copied().unwrap_or(false)
    }
}

fn flatten(value: &Value, prefix: String, out: &mut BTreeMap<String, bool>) {
    let Value::Object(map) = value else { return };
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Bool(flag) => {
                out.insert(path, *flag);
            }
            Value::Object(_) => flatten(value, path, out),
            _ => {}
        }
    }
}

/// Adaptations the conductor performs on behalf of the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Adaptations {
    /// Replay proxy-supplied history into new sessions with a synthetic prompt.
    pub prime_history: bool,
    /// Rewrite `acp:` MCP servers into stdio bridge processes.
    pub bridge_mcp: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationState {
    Negotiating,
    Settled(Adaptations),
}

/// Tracks the per-link declarations and holds editor traffic back until
/// the chain is initialized.
#[derive(Debug)]
pub struct Negotiator {
    records: Vec<Option<CapabilityRecord>>,
    state: NegotiationState,
    deferred: Vec<Message>,
}

impl Negotiator {
    pub fn new(chain_len: usize) -> Self {
        Negotiator {
            records: vec![None; chain_len],
            state: NegotiationState::Negotiating,
            deferred: Vec::new(),
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.state, NegotiationState::Settled(_))
    }

    /// Adaptations in effect. Nothing is adapted before settling.
    pub fn adaptations(&self) -> Adaptations {
        match self.state {
            NegotiationState::Settled(adaptations) => adaptations,
            NegotiationState::Negotiating => Adaptations::default(),
        }
    }

    pub fn record_for(&self, index: usize) -> Option<&CapabilityRecord> {
        self.records.get(index)?.as_ref()
    }

    fn agent_record(&self) -> Option<&CapabilityRecord> {
        self.records.last()?.as_ref()
    }

    /// Hold an editor message until the chain settles.
    pub fn defer(&mut self, message: Message) {
        self.deferred.push(message);
    }

    pub fn deferred(&self) -> &[Message] {
        &self.deferred
    }

    /// Take every deferred message, in arrival order.
    pub fn take_deferred(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.deferred)
    }

    /// Record the `initialize` result produced by link `index`.
    ///
    /// Proxy positions must declare the proxy role; the agent must not.
    pub fn record(&mut self, index: usize, result: &Value) -> Result<(), ConductorError> {
        let is_agent = index + 1 == self.records.len();
        let record = CapabilityRecord::from_initialize_result(result);
        match (is_agent, record.role) {
            (true, Some(Role::Proxy)) => {
                return Err(ConductorError::config(
                    "the last component of the chain declared itself a proxy; a chain must end in an agent",
                ))
            }
            (false, role) if role != Some(Role::Proxy) => {
                return Err(ConductorError::config(format!(
                    "component {index} is in a proxy position but did not declare the proxy role"
                )))
            }
            _ => {}
        }
        tracing::debug!(component_index = index, ?record, "recorded capabilities");
        if let Some(slot) = self.records.get_mut(index) {
            *slot = Some(record);
        }
        Ok(())
    }

    /// Settle negotiation using link 0's `initialize` result and return the
    /// result to hand to the editor.
    pub fn settle(&mut self, link0_result: Value) -> Value {
        let agent = self.agent_record().cloned().unwrap_or_default();
        let proxies = &self.records[..self.records.len().saturating_sub(1)];

        let history_requested = proxies
            .iter()
            .flatten()
            .any(|record| record.has_internal(SESSION_HISTORY));
        let adaptations = Adaptations {
            prime_history: history_requested && !agent.has_internal(SESSION_HISTORY),
            bridge_mcp: !agent.supports("mcpCapabilities.acp")
                && !agent.has_internal(MCP_ACP_TRANSPORT),
        };
        tracing::info!(?adaptations, "capability negotiation settled");
        self.state = NegotiationState::Settled(adaptations);

        self.editor_view(link0_result)
    }

    /// Link 0's result with merged editor-facing flags and nothing internal.
    fn editor_view(&self, mut result: Value) -> Value {
        strip_symposium_meta(&mut result);

        let mut merged: BTreeMap<&str, bool> = BTreeMap::new();
        for record in self.records.iter().flatten() {
            for (path, flag) in &record.features {
                let entry = merged.entry(path.as_str()).or_insert(false);
                *entry |= *flag;
            }
        }

        if let Value::Object(map) = &mut result {
            let capabilities = map
                .entry("agentCapabilities")
                .or_insert_with(|| Value::Object(Map::new()));
            for (path, flag) in merged {
                if flag && !INTERNAL_FEATURES.contains(&path) {
                    set_path(capabilities, path, Value::Bool(true));
                }
            }
            for path in INTERNAL_FEATURES {
                remove_path(capabilities, path);
            }
            if capabilities.as_object().is_some_and(Map::is_empty) {
                map.remove("agentCapabilities");
            }
        }
        result
    }
}

fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Value::Object(map) = current else { return };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment)
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn remove_path(target: &mut Value, path: &str) {
    let Some((parent, leaf)) = path.rsplit_once('.') else {
        if let Value::Object(map) = target {
            map.remove(path);
        }
        return;
    };
    let mut current = target;
    for segment in parent.split('.') {
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Value::Object(map) = current {
        map.remove(leaf);
    }
}

fn symposium_meta_mut(value: &mut Value) -> Option<&mut Map<String, Value>> {
    let Value::Object(map) = value else { return None };
    let meta = map
        .entry(META)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()?;
    meta.entry(SYMPOSIUM)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

/// Set `_meta.symposium.role` on an `initialize` request's params or result.
pub fn set_role(value: &mut Value, role: Role) {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    if let Some(symposium) = symposium_meta_mut(value) {
        symposium.insert(
            "role".to_string(),
            serde_json::to_value(role).unwrap_or(Value::Null),
        );
    }
}

/// Declare internal flags under `_meta.symposium.features`.
pub fn set_features<'a>(value: &mut Value, names: impl IntoIterator<Item = &'a str>) {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    let Some(symposium) = symposium_meta_mut(value) else {
        return;
    };
    let Some(features) = symposium
        .entry("features")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
    else {
        return;
    };
    for name in names {
        features.insert(name.to_string(), Value::Bool(true));
    }
}

/// Remove `_meta.symposium`, and `_meta` itself if nothing else remains.
pub fn strip_symposium_meta(value: &mut Value) {
    let Value::Object(map) = value else { return };
    let Some(Value::Object(meta)) = map.get_mut(META) else {
        return;
    };
    meta.remove(SYMPOSIUM);
    if meta.is_empty() {
        map.remove(META);
    }
}

/// Prepare the params of an `initialize` about to be sent to `index`.
pub fn tag_initialize(params: &mut Option<Value>, is_agent: bool) {
    if is_agent {
        if let Some(params) = params {
            strip_symposium_meta(params);
        }
    } else {
        set_role(params.get_or_insert(Value::Null), Role::Orchestrator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;
    use serde_json::json;

    fn proxy_result(features: Value) -> Value {
        json!({
            "protocolVersion": 1,
            "agentCapabilities": {"loadSession": false},
            "_meta": {"symposium": {"role": "proxy", "features": features}}
        })
    }

    #[test]
    fn test_record_flattens_capabilities() {
        let record = CapabilityRecord::from_initialize_result(&json!({
            "protocolVersion": 1,
            "agentCapabilities": {
                "loadSession": true,
                "promptCapabilities": {"image": true, "audio": false},
                "mcpCapabilities": {"acp": true}
            },
            "_meta": {"symposium": {"role": "proxy", "features": ["session_history"]}}
        }));
        expect![[r#"
            CapabilityRecord {
                version: Some(
                    "1",
                ),
                role: Some(
                    Proxy,
                ),
                features: {
                    "loadSession": true,
                    "mcpCapabilities.acp": true,
                    "promptCapabilities.audio": false,
                    "promptCapabilities.image": true,
                },
                internal: {
                    "session_history": true,
                },
            }
        "#]]
        .assert_debug_eq(&record);
    }

    #[test]
    fn test_settle_merges_and_strips() {
        let mut negotiator = Negotiator::new(2);
        let agent = json!({
            "protocolVersion": 1,
            "agentCapabilities": {"loadSession": true, "mcpCapabilities": {"acp": false, "http": true}}
        });
        negotiator.record(1, &agent).unwrap();
        let proxy = proxy_result(json!({"session_history": true}));
        negotiator.record(0, &proxy).unwrap();

        let editor = negotiator.settle(proxy);
        assert_eq!(
            editor,
            json!({
                "protocolVersion": 1,
                "agentCapabilities": {"loadSession": true, "mcpCapabilities": {"http": true}}
            })
        );
        assert_eq!(
            negotiator.adaptations(),
            Adaptations {
                prime_history: true,
                bridge_mcp: true
            }
        );
    }

    #[test]
    fn test_native_agent_needs_no_adaptation() {
        let mut negotiator = Negotiator::new(2);
        negotiator
            .record(
                1,
                &json!({
                    "agentCapabilities": {"mcpCapabilities": {"acp": true}},
                    "_meta": {"symposium": {"features": {"session_history": true}}}
                }),
            )
            .unwrap();
        let proxy = proxy_result(json!({"session_history": true}));
        negotiator.record(0, &proxy).unwrap();
        negotiator.settle(proxy);
        assert_eq!(negotiator.adaptations(), Adaptations::default());
    }

    #[test]
    fn test_role_violations() {
        let mut negotiator = Negotiator::new(2);
        let error = negotiator
            .record(1, &json!({"_meta": {"symposium": {"role": "proxy"}}}))
            .unwrap_err();
        assert!(matches!(error, ConductorError::Config(_)));

        let error = negotiator.record(0, &json!({"protocolVersion": 1})).unwrap_err();
        assert!(matches!(error, ConductorError::Config(_)));
    }

    #[test]
    fn test_tag_initialize() {
        let mut params = Some(json!({"protocolVersion": 1}));
        tag_initialize(&mut params, false);
        assert_eq!(
            params,
            Some(json!({"protocolVersion": 1, "_meta": {"symposium": {"role": "orchestrator"}}}))
        );
        tag_initialize(&mut params, true);
        assert_eq!(params, Some(json!({"protocolVersion": 1})));

        let mut none = None;
        tag_initialize(&mut none, false);
        assert_eq!(none, Some(json!({"_meta": {"symposium": {"role": "orchestrator"}}})));
    }

    #[test]
    fn test_deferred_messages_keep_order() {
        let mut negotiator = Negotiator::new(1);
        negotiator.defer(Message::notification("a", None));
        negotiator.defer(Message::notification("b", None));
        let methods: Vec<_> = negotiator
            .take_deferred()
            .into_iter()
            .filter_map(|m| m.method)
            .collect();
        assert_eq!(methods, ["a", "b"]);
        assert!(negotiator.deferred().is_empty());
    }
}
