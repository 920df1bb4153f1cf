//! Plugin boundary.
//!
//! A plugin contributes capability handlers and, optionally, the State Tree
//! subtrees it owns. How plugins are discovered is outside this crate: the
//! host passes plugin values to [`InstanceBuilder::plugin`], and all of them
//! are registered before the instance accepts its first connection.
//!
//! [`InstanceBuilder::plugin`]: crate::instance::InstanceBuilder::plugin

use crate::dispatch::HandlerDescriptor;
use crate::protocol::MessageType;
use crate::state::SchemaFragment;

/// An extension adding capabilities to an instance.
pub trait Plugin: Send + Sync {
    /// Name for logs and schema ownership.
    fn name(&self) -> &str;

    /// Handlers to register, keyed by message type.
    fn capabilities(&self) -> Vec<(MessageType, HandlerDescriptor)>;

    /// Subtrees of the State Tree this plugin owns.
    fn schema(&self) -> Option<SchemaFragment> {
        None
    }
}
