//! Bridge between the tag store and the OPC UA address space.
//!
//! The address space is mutated only on the OPC UA runtime: synchronous
//! callers (REST handlers) enqueue typed commands on an mpsc channel whose
//! sole consumer runs there. Until the runtime has wired the channel,
//! sends are silent no-ops and the periodic mirror reconciles the gap.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use opcua::nodes::NodeBase;
use opcua::server::address_space::Variable;
use opcua::server::node_manager::memory::SimpleNodeManager;
use opcua::server::ServerHandle;
use opcua::types::{DataValue, LocalizedText, NodeId, Variant, VariantScalarTypeId};
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::tags::store::TagStore;
use crate::tags::structures::{Tag, TagValue};

/// Metadata needed to create a variable node for a tag.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub tag_id: String,
    pub name: String,
    pub data_type: String,
    pub description: Option<String>,
    pub writable: bool,
}

impl From<&Tag> for NodeSpec {
    fn from(tag: &Tag) -> Self {
        NodeSpec {
            tag_id: tag.tag_id.clone(),
            name: tag.name.clone(),
            data_type: tag.data_type.clone(),
            description: tag.description.clone(),
            writable: tag.writable,
        }
    }
}

/// Commands accepted by the OPC UA runtime.
#[derive(Debug)]
pub enum NodeCommand {
    Create(NodeSpec),
    UpdateValue { tag_id: String, value: TagValue },
    Delete { tag_id: String },
    Shutdown { ack: Option<oneshot::Sender<()>> },
}

/// Cheap-to-clone sender wired once at server start. Sending before the
/// runtime is up (startup race) is a no-op.
#[derive(Clone, Default)]
pub struct NodeCommandSender {
    slot: Arc<OnceLock<mpsc::UnboundedSender<NodeCommand>>>,
}

impl NodeCommandSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wire(&self, tx: mpsc::UnboundedSender<NodeCommand>) {
        let _ = self.slot.set(tx);
    }

    /// Enqueue a command; returns false when the runtime is not reachable.
    pub fn send(&self, command: NodeCommand) -> bool {
        match self.slot.get() {
            Some(tx) => tx.send(command).is_ok(),
            None => {
                debug!("OPC UA runtime not initialized; node command dropped");
                false
            }
        }
    }
}

/// OPC UA variant type for a tag data type, matched by case-insensitive
/// substring.
pub fn variant_type_for(data_type: &str) -> VariantScalarTypeId {
    let d = data_type.to_ascii_lowercase();
    if d.contains("bool") {
        VariantScalarTypeId::Boolean
    } else if d.contains("uint") {
        VariantScalarTypeId::UInt32
    } else if d.contains("int") {
        VariantScalarTypeId::Int64
    } else if d.contains("float") {
        VariantScalarTypeId::Float
    } else if d.contains("double") {
        VariantScalarTypeId::Double
    } else if d.contains("string") || d.contains("str") {
        VariantScalarTypeId::String
    } else {
        VariantScalarTypeId::Double
    }
}

/// Coerce a stored value into a variant acceptable for an OPC UA write.
/// Decimals become integers for integer/boolean targets and floats
/// otherwise; native scalars pass through.
pub fn normalize_for_opc(value: &TagValue, target: Option<VariantScalarTypeId>) -> Variant {
    match value {
        TagValue::Decimal(d) => match target {
            Some(VariantScalarTypeId::Int64) => Variant::from(d.trunc().to_i64().unwrap_or_default()),
            Some(VariantScalarTypeId::UInt32) => Variant::from(d.trunc().to_u32().unwrap_or_default()),
            Some(VariantScalarTypeId::Boolean) => Variant::from(!d.is_zero()),
            Some(VariantScalarTypeId::Float) => Variant::from(d.to_f32().unwrap_or_default()),
            _ => Variant::from(d.to_f64().unwrap_or_default()),
        },
        TagValue::Bool(b) => Variant::from(*b),
        TagValue::Int(i) => Variant::from(*i),
        TagValue::UInt(u) => Variant::from(*u),
        TagValue::Float(f) => Variant::from(*f),
        TagValue::Text(s) => Variant::from(s.as_str()),
    }
}

/// Owns the `tag_id -> NodeId` bookkeeping and all address-space edits.
/// Constructed and used only on the OPC UA runtime.
pub struct OpcUaBridge {
    namespace: u16,
    folder: NodeId,
    manager: Arc<SimpleNodeManager>,
    handle: ServerHandle,
    store: Arc<TagStore>,
    vars: HashMap<String, NodeId>,
}

impl OpcUaBridge {
    pub fn new(
        namespace: u16,
        folder: NodeId,
        manager: Arc<SimpleNodeManager>,
        handle: ServerHandle,
        store: Arc<TagStore>,
    ) -> Self {
        OpcUaBridge {
            namespace,
            folder,
            manager,
            handle,
            store,
            vars: HashMap::new(),
        }
    }

    pub fn contains(&self, tag_id: &str) -> bool {
        self.vars.contains_key(tag_id)
    }

    pub fn tag_ids(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    /// Add a variable node for a tag and remember its handle. Failures are
    /// logged and swallowed; the next create for the same tag wins.
    pub fn create_node(&mut self, spec: &NodeSpec) {
        let vtype = variant_type_for(&spec.data_type);
        let value = self
            .store
            .get_value(&spec.tag_id)
            .unwrap_or_else(|| TagValue::default_for(&spec.data_type));
        let initial = normalize_for_opc(&value, Some(vtype));

        let node_id = NodeId::new(self.namespace, spec.tag_id.clone());
        let display_name = if spec.name.is_empty() {
            spec.tag_id.clone()
        } else {
            spec.name.clone()
        };
        let mut variable = Variable::new(
            &node_id,
            spec.tag_id.as_str(),
            display_name.as_str(),
            initial,
        );
        if let Some(description) = &spec.description {
            variable.set_description(LocalizedText::from(description.as_str()));
        }
        if spec.writable {
            variable.set_writable(true);
        }

        {
            let space = self.manager.address_space();
            let mut space = space.write();
            let _ = space.add_variables(vec![variable], &self.folder);
        }
        self.vars.insert(spec.tag_id.clone(), node_id);
    }

    /// Write a new value to a tag's variable. Missing nodes are a no-op.
    pub fn update_value(&self, tag_id: &str, value: &TagValue) {
        let Some(node_id) = self.vars.get(tag_id) else {
            return;
        };
        let variant = normalize_for_opc(value, None);
        if let Err(e) = self.manager.set_value(
            self.handle.subscriptions(),
            node_id,
            None,
            DataValue::new_now(variant),
        ) {
            error!("Failed to write OPC UA variable for tag {}: {}", tag_id, e);
        }
    }

    /// Delete a tag's variable node. The bookkeeping entry is removed even
    /// when the address-space delete fails.
    pub fn delete_node(&mut self, tag_id: &str) {
        if let Some(node_id) = self.vars.remove(tag_id) {
            let space = self.manager.address_space();
            let mut space = space.write();
            let _ = space.delete(&node_id, true);
        }
    }

    /// Mirror the current store values into every known variable node.
    /// Called once per poll cycle; individual write failures do not stop
    /// the rest.
    pub fn sync_values(&self) {
        for (tag_id, _) in self.vars.iter() {
            if let Some(value) = self.store.get_value(tag_id) {
                self.update_value(tag_id, &value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn variant_types_match_by_substring() {
        assert_eq!(variant_type_for("Boolean"), VariantScalarTypeId::Boolean);
        assert_eq!(variant_type_for("UInt32"), VariantScalarTypeId::UInt32);
        assert_eq!(variant_type_for("Int16"), VariantScalarTypeId::Int64);
        assert_eq!(variant_type_for("Int64"), VariantScalarTypeId::Int64);
        assert_eq!(variant_type_for("Float"), VariantScalarTypeId::Float);
        assert_eq!(variant_type_for("Double"), VariantScalarTypeId::Double);
        assert_eq!(variant_type_for("String"), VariantScalarTypeId::String);
        assert_eq!(variant_type_for("str"), VariantScalarTypeId::String);
        assert_eq!(variant_type_for("Something"), VariantScalarTypeId::Double);
    }

    #[test]
    fn decimals_coerce_to_the_target_type() {
        let d = TagValue::Decimal(Decimal::from_str("7.9").unwrap());
        assert_eq!(
            normalize_for_opc(&d, Some(VariantScalarTypeId::Int64)),
            Variant::from(7i64)
        );
        assert_eq!(
            normalize_for_opc(&d, Some(VariantScalarTypeId::Boolean)),
            Variant::from(true)
        );
        assert_eq!(normalize_for_opc(&d, None), Variant::from(7.9f64));
    }

    #[test]
    fn native_scalars_pass_through() {
        assert_eq!(
            normalize_for_opc(&TagValue::Bool(true), None),
            Variant::from(true)
        );
        assert_eq!(
            normalize_for_opc(&TagValue::Int(-4), None),
            Variant::from(-4i64)
        );
        assert_eq!(
            normalize_for_opc(&TagValue::Text("run".into()), None),
            Variant::from("run")
        );
    }
}
