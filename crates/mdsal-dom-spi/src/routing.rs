//! RPC routing strategy.
//!
//! An RPC whose input carries a leaf marked as a context reference is routed
//! by the value of that leaf; any other RPC has a single global
//! implementation.

use serde::{Deserialize, Serialize};

use crate::types::QName;

/// One input leaf of an RPC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafDefinition {
    /// Leaf name.
    pub name: QName,
    /// Identity of the routing context this leaf references, if any.
    #[serde(default)]
    pub context_reference: Option<QName>,
}

impl LeafDefinition {
    /// A plain input leaf.
    pub fn new(name: impl Into<QName>) -> Self {
        Self {
            name: name.into(),
            context_reference: None,
        }
    }

    /// A leaf carrying the routing context `context`.
    pub fn context_reference(name: impl Into<QName>, context: impl Into<QName>) -> Self {
        Self {
            name: name.into(),
            context_reference: Some(context.into()),
        }
    }
}

/// Shape of an RPC, as far as routing is concerned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcDefinition {
    /// RPC name.
    pub name: QName,
    /// Input leaves in declaration order.
    #[serde(default)]
    pub input: Vec<LeafDefinition>,
}

/// How invocations of one RPC are dispatched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcRoutingStrategy {
    /// Dispatched by the value of `leaf`, which references `context`.
    Routed {
        /// RPC name.
        rpc: QName,
        /// Routing context identity.
        context: QName,
        /// Input leaf carrying the route.
        leaf: QName,
    },
    /// One implementation serves every invocation.
    Global {
        /// RPC name.
        rpc: QName,
    },
}

impl RpcRoutingStrategy {
    /// Derive the strategy from an RPC definition. The first context
    /// reference in the input wins.
    pub fn from_definition(definition: &RpcDefinition) -> Self {
        let routed = definition.input.iter().find_map(|leaf| {
            leaf.context_reference
                .as_ref()
                .map(|context| (context.clone(), leaf.name.clone()))
        });

        match routed {
            Some((context, leaf)) => RpcRoutingStrategy::Routed {
                rpc: definition.name.clone(),
                context,
                leaf,
            },
            None => RpcRoutingStrategy::Global {
                rpc: definition.name.clone(),
            },
        }
    }

    /// RPC this strategy belongs to.
    pub fn identifier(&self) -> &QName {
        match self {
            RpcRoutingStrategy::Routed { rpc, .. } | RpcRoutingStrategy::Global { rpc } => rpc,
        }
    }

    /// Whether invocations are routed by context.
    pub fn is_context_based_routed(&self) -> bool {
        matches!(self, RpcRoutingStrategy::Routed { .. })
    }

    /// Routing context, for routed RPCs.
    pub fn context(&self) -> Option<&QName> {
        match self {
            RpcRoutingStrategy::Routed { context, .. } => Some(context),
            RpcRoutingStrategy::Global { .. } => None,
        }
    }

    /// Routing leaf, for routed RPCs.
    pub fn leaf(&self) -> Option<&QName> {
        match self {
            RpcRoutingStrategy::Routed { leaf, .. } => Some(leaf),
            RpcRoutingStrategy::Global { .. } => None,
        }
    }
}

impl From<&RpcDefinition> for RpcRoutingStrategy {
    fn from(definition: &RpcDefinition) -> Self {
        Self::from_definition(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_without_context_reference() {
        let definition = RpcDefinition {
            name: QName::from("reset"),
            input: vec![LeafDefinition::new("force")],
        };
        let strategy = RpcRoutingStrategy::from(&definition);
        assert!(!strategy.is_context_based_routed());
        assert_eq!(strategy.identifier().as_str(), "reset");
        assert!(strategy.context().is_none());
        assert!(strategy.leaf().is_none());
    }

    #[test]
    fn test_routed_by_first_context_reference() {
        let definition = RpcDefinition {
            name: QName::from("reboot"),
            input: vec![
                LeafDefinition::new("delay"),
                LeafDefinition::context_reference("node", "node-context"),
                LeafDefinition::context_reference("other", "other-context"),
            ],
        };
        let strategy = RpcRoutingStrategy::from_definition(&definition);
        assert_eq!(
            strategy,
            RpcRoutingStrategy::Routed {
                rpc: QName::from("reboot"),
                context: QName::from("node-context"),
                leaf: QName::from("node"),
            }
        );
    }

    #[test]
    fn test_definition_from_json() {
        let definition: RpcDefinition = serde_json::from_str(
            r#"{"name":"ping","input":[{"name":"target","context_reference":"host"}]}"#,
        )
        .unwrap();
        assert_eq!(RpcRoutingStrategy::from(&definition).leaf(), Some(&QName::from("target")));
    }
}
