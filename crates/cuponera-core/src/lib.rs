//! Core domain model and identity resolution for Cuponera.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cuponera-core";

pub const DEFAULT_CURRENCY: &str = "CLP";

/// Payment instrument category a discount is tied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    #[default]
    Bank,
    RetailCard,
    Coupon,
    Club,
}

/// Embedded merchant reference carried by each discount. Lookup data only;
/// merchants have no lifecycle of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRef {
    pub name: String,
    pub slug: String,
    pub logo_url: Option<String>,
    pub website: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl StoreRef {
    pub fn from_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            slug: slugify(name),
            logo_url: None,
            website: None,
            categories: Vec::new(),
        }
    }
}

/// Embedded payment method reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodRef {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub kind: PaymentKind,
    pub logo_url: Option<String>,
}

impl PaymentMethodRef {
    pub fn from_name(name: &str, kind: PaymentKind) -> Self {
        Self {
            name: name.to_string(),
            slug: slugify(name),
            kind,
            logo_url: None,
        }
    }
}

/// Canonical persisted discount record.
///
/// Identity is the triple (`id`, `external_id`, `source`); the pair
/// `(source, external_id)` is unique across the whole record population no
/// matter which backend holds the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discount {
    pub id: Uuid,
    pub source: String,
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub discount_percentage: Option<f64>,
    pub discount_amount: Option<f64>,
    pub currency: String,
    pub store: StoreRef,
    #[serde(default)]
    pub payment_methods: Vec<PaymentMethodRef>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub url: String,
    pub affiliate_url: Option<String>,
    pub image_url: Option<String>,
    pub active: bool,
    pub verified: bool,
    pub last_verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clicks: i64,
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub dislikes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Discount {
    /// Materialize a crawler candidate into a fresh record: unverified,
    /// active, zero counters, defaulted currency.
    pub fn from_draft(draft: DiscountDraft, now: DateTime<Utc>) -> Self {
        let store = draft.store_ref();
        let payment_methods = draft.payment_method_refs();
        Self {
            id: Uuid::new_v4(),
            source: draft.source,
            external_id: draft.external_id,
            title: draft.title,
            description: draft.description,
            discount_percentage: draft.discount_percentage,
            discount_amount: draft.discount_amount,
            currency: draft
                .currency
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            store,
            payment_methods,
            valid_from: draft.valid_from,
            valid_until: draft.valid_until,
            url: draft.url,
            affiliate_url: draft.affiliate_url,
            image_url: draft.image_url,
            active: true,
            verified: false,
            last_verified_at: None,
            clicks: 0,
            likes: 0,
            dislikes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update in place. Identity, counters and `created_at`
    /// survive a content refresh; every patch bumps `updated_at`.
    pub fn apply_patch(&mut self, patch: &DiscountPatch, now: DateTime<Utc>) {
        match patch {
            DiscountPatch::SetVerified { verified, at } => {
                self.verified = *verified;
                self.last_verified_at = Some(*at);
            }
            DiscountPatch::Increment(counter) => match counter {
                Counter::Clicks => self.clicks += 1,
                Counter::Likes => self.likes += 1,
                Counter::Dislikes => self.dislikes += 1,
            },
            DiscountPatch::Refresh(draft) => {
                self.title = draft.title.clone();
                self.description = draft.description.clone();
                self.discount_percentage = draft.discount_percentage;
                self.discount_amount = draft.discount_amount;
                if let Some(currency) = &draft.currency {
                    self.currency = currency.clone();
                }
                self.store = draft.store_ref();
                self.payment_methods = draft.payment_method_refs();
                self.valid_from = draft.valid_from;
                self.valid_until = draft.valid_until;
                self.url = draft.url.clone();
                self.affiliate_url = draft.affiliate_url.clone();
                self.image_url = draft.image_url.clone();
                self.active = true;
            }
        }
        self.updated_at = now;
    }

    /// Where a click-through should land, preferring the monetized link.
    pub fn outbound_url(&self) -> &str {
        self.affiliate_url.as_deref().unwrap_or(&self.url)
    }
}

/// Candidate emitted by the external crawl job; the handoff file is a JSON
/// array of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountDraft {
    pub source: String,
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub discount_percentage: Option<f64>,
    pub discount_amount: Option<f64>,
    pub currency: Option<String>,
    pub url: String,
    pub affiliate_url: Option<String>,
    pub image_url: Option<String>,
    pub store_name: String,
    pub store_slug: Option<String>,
    #[serde(default)]
    pub payment_methods: Vec<DraftPaymentMethod>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftPaymentMethod {
    pub name: String,
    #[serde(default)]
    pub kind: PaymentKind,
    pub slug: Option<String>,
}

impl DiscountDraft {
    pub fn store_ref(&self) -> StoreRef {
        StoreRef {
            name: self.store_name.clone(),
            slug: self
                .store_slug
                .clone()
                .unwrap_or_else(|| slugify(&self.store_name)),
            logo_url: None,
            website: None,
            categories: Vec::new(),
        }
    }

    pub fn payment_method_refs(&self) -> Vec<PaymentMethodRef> {
        self.payment_methods
            .iter()
            .map(|pm| PaymentMethodRef {
                name: pm.name.clone(),
                slug: pm.slug.clone().unwrap_or_else(|| slugify(&pm.name)),
                kind: pm.kind,
                logo_url: None,
            })
            .collect()
    }
}

/// Engagement counters that support atomic increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Counter {
    Clicks,
    Likes,
    Dislikes,
}

/// Partial-update vocabulary understood by every record backend.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscountPatch {
    SetVerified { verified: bool, at: DateTime<Utc> },
    Increment(Counter),
    Refresh(Box<DiscountDraft>),
}

/// Registered account; favorites hold canonical discount record ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub favorites: BTreeSet<Uuid>,
    pub session_token_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A client-supplied discount reference: either a native record id or a
/// crawler-assigned external id.
///
/// Matching checks native-id equality first, then the external id; the first
/// match wins. All lookup and update paths resolve references through this
/// type so both forms behave identically everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscountRef {
    raw: String,
    native: Option<Uuid>,
}

impl DiscountRef {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into().trim().to_string();
        let native = Uuid::parse_str(&raw).ok();
        Self { raw, native }
    }

    pub fn from_id(id: Uuid) -> Self {
        Self {
            raw: id.to_string(),
            native: Some(id),
        }
    }

    pub fn native_id(&self) -> Option<Uuid> {
        self.native
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, discount: &Discount) -> bool {
        if let Some(id) = self.native {
            if id == discount.id {
                return true;
            }
        }
        self.raw == discount.external_id
    }
}

impl fmt::Display for DiscountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Lowercased dash-joined slug used for merchant and payment method lookups.
pub fn slugify(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}
