//! Query selection trees.
//!
//! The (out-of-scope) query compiler hands the engine an immutable,
//! pre-resolved selection tree. This module defines that shape: a closed
//! tagged enum of field kinds dispatched by exhaustive matching, plus the
//! builder constructors tests and callers use to assemble selections by hand.
//!
//! Storage keys are argument-qualified by the compiler (e.g.
//! `friends{first:"10"}`); by default the storage key equals the field name.

use serde::{Deserialize, Serialize};

use crate::store::record::StorageKey;

// ── Connection arguments ───────────────────────────────────────────

/// Pagination window for one connection field.
///
/// Forward pagination uses `first`/`after`; backward uses `last`/`before`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionArgs {
    pub first: Option<usize>,
    pub after: Option<String>,
    pub last: Option<usize>,
    pub before: Option<String>,
}

impl ConnectionArgs {
    /// `first: n` window from the start of the connection.
    pub fn first(n: usize) -> Self {
        Self {
            first: Some(n),
            ..Self::default()
        }
    }

    /// `first: n, after: cursor` window.
    pub fn first_after(n: usize, cursor: impl Into<String>) -> Self {
        Self {
            first: Some(n),
            after: Some(cursor.into()),
            ..Self::default()
        }
    }

    /// `last: n` window from the end of the connection.
    pub fn last(n: usize) -> Self {
        Self {
            last: Some(n),
            ..Self::default()
        }
    }

    /// `last: n, before: cursor` window.
    pub fn last_before(n: usize, cursor: impl Into<String>) -> Self {
        Self {
            last: Some(n),
            before: Some(cursor.into()),
            ..Self::default()
        }
    }

    pub fn is_forward(&self) -> bool {
        self.first.is_some() || self.last.is_none()
    }
}

// ── Selection tree ─────────────────────────────────────────────────

/// Field kind resolved at compile time by the query compiler.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionKind {
    /// Leaf value: scalar, null, or array of scalars.
    Scalar,
    /// Single linked record.
    LinkedSingular(Vec<Selection>),
    /// List of linked records.
    LinkedPlural(Vec<Selection>),
    /// Paginated connection. Child selections apply to each *edge* record
    /// (typically a `node` linked field plus edge-level scalars); `cursor`
    /// and `pageInfo` are handled by the range machinery.
    Connection {
        args: ConnectionArgs,
        edge_selections: Vec<Selection>,
    },
    /// Fragment conditioned on a concrete type; applied only when the
    /// record's resolved type name matches.
    TypeRefinement {
        type_condition: String,
        selections: Vec<Selection>,
    },
    /// Named fragment. The composite hash identifies this exact fragment
    /// structure in the query tracker.
    FragmentReference {
        fragment_name: String,
        composite_hash: u128,
        deferred: bool,
        selections: Vec<Selection>,
    },
}

/// One node of a query selection tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Schema field name (or fragment/type condition for non-field nodes).
    pub name: String,
    /// Response alias; payload lookup uses the alias when present.
    pub alias: Option<String>,
    /// Argument-qualified storage key.
    pub storage_key: StorageKey,
    pub kind: SelectionKind,
}

impl Selection {
    fn node(name: impl Into<String>, kind: SelectionKind) -> Self {
        let name = name.into();
        Self {
            storage_key: name.clone(),
            name,
            alias: None,
            kind,
        }
    }

    pub fn scalar(name: impl Into<String>) -> Self {
        Self::node(name, SelectionKind::Scalar)
    }

    pub fn linked(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::node(name, SelectionKind::LinkedSingular(selections))
    }

    pub fn plural(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::node(name, SelectionKind::LinkedPlural(selections))
    }

    pub fn connection(
        name: impl Into<String>,
        args: ConnectionArgs,
        edge_selections: Vec<Selection>,
    ) -> Self {
        Self::node(
            name,
            SelectionKind::Connection {
                args,
                edge_selections,
            },
        )
    }

    pub fn refinement(type_condition: impl Into<String>, selections: Vec<Selection>) -> Self {
        let type_condition = type_condition.into();
        Self::node(
            type_condition.clone(),
            SelectionKind::TypeRefinement {
                type_condition,
                selections,
            },
        )
    }

    /// Named fragment reference. The composite hash is derived from the
    /// fragment name and its selection structure.
    pub fn fragment(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::fragment_inner(name.into(), false, selections)
    }

    /// Deferred fragment reference (delivered by a follow-up payload).
    pub fn deferred_fragment(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::fragment_inner(name.into(), true, selections)
    }

    fn fragment_inner(name: String, deferred: bool, selections: Vec<Selection>) -> Self {
        let composite_hash = fragment_hash(&name, &selections);
        Self::node(
            name.clone(),
            SelectionKind::FragmentReference {
                fragment_name: name,
                composite_hash,
                deferred,
                selections,
            },
        )
    }

    /// Override the response alias.
    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Override the storage key (argument-qualified fields).
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    /// Key under which this selection appears in a response payload.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

// ── Root selections ────────────────────────────────────────────────

/// A root-level query: one root call plus the selections beneath it.
///
/// `(field_name, arg_signature)` keys the store's root-call index; the
/// argument signature is the compiler-produced canonical rendering of the
/// root field's identifying argument (empty when there is none).
#[derive(Debug, Clone, PartialEq)]
pub struct RootSelection {
    pub field_name: String,
    pub arg_signature: String,
    pub selections: Vec<Selection>,
}

impl RootSelection {
    pub fn new(
        field_name: impl Into<String>,
        arg_signature: impl Into<String>,
        selections: Vec<Selection>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            arg_signature: arg_signature.into(),
            selections,
        }
    }

    /// Key into the store's root-call index.
    pub fn root_call_key(&self) -> String {
        root_call_key(&self.field_name, &self.arg_signature)
    }
}

/// Canonical root-call index key.
pub fn root_call_key(field_name: &str, arg_signature: &str) -> String {
    format!("{field_name}({arg_signature})")
}

// ── Fragment hashing ───────────────────────────────────────────────

/// Composite hash of a fragment: blake3 over the fragment name and the
/// recursive storage-key structure, truncated to u128.
pub fn fragment_hash(name: &str, selections: &[Selection]) -> u128 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    hash_selections(&mut hasher, selections);
    let digest = hasher.finalize();
    u128::from_le_bytes(digest.as_bytes()[0..16].try_into().expect("digest >= 16 bytes"))
}

fn hash_selections(hasher: &mut blake3::Hasher, selections: &[Selection]) {
    for sel in selections {
        hasher.update(b"(");
        hasher.update(sel.storage_key.as_bytes());
        match &sel.kind {
            SelectionKind::Scalar => {}
            SelectionKind::LinkedSingular(children) | SelectionKind::LinkedPlural(children) => {
                hash_selections(hasher, children);
            }
            SelectionKind::Connection {
                edge_selections, ..
            } => {
                hasher.update(b"@");
                hash_selections(hasher, edge_selections);
            }
            SelectionKind::TypeRefinement {
                type_condition,
                selections,
            } => {
                hasher.update(type_condition.as_bytes());
                hash_selections(hasher, selections);
            }
            SelectionKind::FragmentReference {
                composite_hash, ..
            } => {
                hasher.update(&composite_hash.to_le_bytes());
            }
        }
        hasher.update(b")");
    }
}

// ── Tests ──────────────────────────────────────────────────────────
