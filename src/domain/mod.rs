//! Core identity value objects: trust domains, SPIFFE URIs, selectors,
//! registration mappers, and issued documents.
//!
//! Everything in this module is immutable after construction and safe to
//! share across threads. Parsing is the only way to obtain an instance.

mod document;
mod identity;
mod mapper;
mod selector;
mod trust_domain;

pub use document::{Identity, IdentityDocument, TrustBundle};
pub use identity::SpiffeId;
pub use mapper::IdentityMapper;
pub use selector::{Selector, SelectorSet};
pub use trust_domain::TrustDomain;
