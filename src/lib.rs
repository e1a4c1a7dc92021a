//! # cinder-ui
//!
//! A component-based reactive UI rendering runtime.
//!
//! Templates compile once per [`app::App`] into render programs; each render
//! produces a tree of [`block::Block`]s, and patching that tree against the
//! previous one touches only the DOM positions whose data actually changed.
//! Re-renders are driven by a fine-grained reactivity layer: components
//! subscribe to exactly the state keys they read, and mutations schedule one
//! batched re-render per component per microtask generation.
//!
//! ## Modules
//!
//! - [`value`] - The dynamic value union and prototype-chained scopes
//! - [`reactivity`] - Key-level subscriptions, observers, the mutation guard
//! - [`dom`] - The in-memory DOM the blocks render into
//! - [`block`] - The block runtime (mount/patch/remove of render output)
//! - [`compiler`] - Expression, template and render-program compilation
//! - [`component`] - Component types, instances and their lifecycle
//! - [`fibers`] - Units of in-flight rendering work
//! - [`scheduler`] - Microtasks, the local executor and flush checkpoints
//! - [`hooks`] - The setup-time hook API
//! - [`app`] - Application instances tying it all together

pub mod app;
pub mod block;
pub mod compiler;
pub mod component;
pub mod dom;
pub mod error;
pub mod fibers;
pub mod hooks;
pub mod reactivity;
pub mod scheduler;
pub mod value;

pub use app::{App, MountedRoot, TemplateSet};
pub use component::{ComponentNode, ComponentType, Status};
pub use dom::{Document, DomNode};
pub use error::{CinderError, Result};
pub use hooks::{
    RefHandle, expose, on_error, on_mounted, on_patched, on_rendered, on_will_destroy,
    on_will_patch, on_will_render, on_will_start, on_will_unmount, on_will_update_props,
    use_env, use_ref, use_state,
};
pub use reactivity::reactive;
pub use value::{Scope, Value};
