//! cairn-nodedb — a database collecting information about a mesh network.
//!
//! Oriented at batman-adv meshes carrying Gluon-style node metadata. It
//! pulls the three payload shapes from a local Cairn daemon, resolves
//! node identity aliases, and provides data in formats suitable for mesh
//! visualization, which is its main aim.

pub mod export;
pub mod gluon;
pub mod items;
pub mod logdb;
pub mod nodedb;
pub mod store;
pub mod update;
pub mod vis;

pub use nodedb::{NodeDb, Settings};
pub use store::{Bucket, Db, Meta, Notification, StoreError};
