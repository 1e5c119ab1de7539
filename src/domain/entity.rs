//! Entity Kinds, Claims and Slot Scopes
//!
//! Value objects naming what a verification request is about and which
//! slot-allocation domain an allocator call targets.

use serde::{Deserialize, Serialize};

// =============================================================================
// Entity Kind
// =============================================================================

/// Kind of entity the cache answers verification requests for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A user; the cached value is the user's role name
    Role,
    /// A category; the cached value is `active` or `passive`
    Category,
    /// A subcategory; the cached value is `active` or `passive`
    Subcategory,
    /// A product; the cached value is `active` or `passive`
    Product,
}

impl EntityKind {
    /// All kinds, in a stable order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Role,
        EntityKind::Category,
        EntityKind::Subcategory,
        EntityKind::Product,
    ];

    /// Whether verification of this kind compares a claimed value.
    pub fn requires_claim(&self) -> bool {
        matches!(self, EntityKind::Role)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Role => write!(f, "Role"),
            EntityKind::Category => write!(f, "Category"),
            EntityKind::Subcategory => write!(f, "Subcategory"),
            EntityKind::Product => write!(f, "Product"),
        }
    }
}

// =============================================================================
// Claim
// =============================================================================

/// Optional claimed attribute carried by a verification request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Claim {
    /// No claim: the request asks whether the entity is active
    #[default]
    None,
    /// Claimed role name of a user
    Role(String),
}

impl Claim {
    /// Create a role claim.
    pub fn role(role: impl Into<String>) -> Self {
        Claim::Role(role.into())
    }

    /// The claimed role, if any.
    pub fn as_role(&self) -> Option<&str> {
        match self {
            Claim::None => None,
            Claim::Role(role) => Some(role),
        }
    }
}

// =============================================================================
// Slot Scopes
// =============================================================================

/// Family of slot scopes, used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Categories,
    Subcategories,
    Products,
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeKind::Categories => write!(f, "category"),
            ScopeKind::Subcategories => write!(f, "subcategory"),
            ScopeKind::Products => write!(f, "product"),
        }
    }
}

/// An independent slot-allocation domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The global category space
    Categories,
    /// The subcategory space of one category
    Subcategories(String),
    /// The product space of one subcategory
    Products(String),
}

impl Scope {
    pub fn categories() -> Self {
        Scope::Categories
    }

    pub fn subcategories(category_id: impl Into<String>) -> Self {
        Scope::Subcategories(category_id.into())
    }

    pub fn products(subcategory_id: impl Into<String>) -> Self {
        Scope::Products(subcategory_id.into())
    }

    /// The scope family.
    pub fn kind(&self) -> ScopeKind {
        match self {
            Scope::Categories => ScopeKind::Categories,
            Scope::Subcategories(_) => ScopeKind::Subcategories,
            Scope::Products(_) => ScopeKind::Products,
        }
    }

    /// Whether the scope has a fixed capacity.
    pub fn is_bounded(&self) -> bool {
        !matches!(self, Scope::Products(_))
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Categories => write!(f, "categories"),
            Scope::Subcategories(id) => write!(f, "subcategories of {}", id),
            Scope::Products(id) => write!(f, "products of {}", id),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
