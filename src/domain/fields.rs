//! Field Categories
//!
//! Typed per-category records decoded from provider JSON. Providers disagree on
//! naming (snake_case vs camelCase) and on whether numbers arrive as strings, so
//! every field is read independently: a field that fails to decode becomes `None`
//! and never invalidates the rest of the record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Cache freshness class of a piece of data.
///
/// Ordered roughly by volatility: prices move every block, security flags almost never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCategory {
    Price,
    Volume,
    Holders,
    Metadata,
    Security,
}

impl FieldCategory {
    pub const ALL: [FieldCategory; 5] = [
        FieldCategory::Price,
        FieldCategory::Volume,
        FieldCategory::Holders,
        FieldCategory::Metadata,
        FieldCategory::Security,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldCategory::Price => "price",
            FieldCategory::Volume => "volume",
            FieldCategory::Holders => "holders",
            FieldCategory::Metadata => "metadata",
            FieldCategory::Security => "security",
        }
    }
}

impl fmt::Display for FieldCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read the first alias that decodes as a finite number.
fn number(obj: &Map<String, Value>, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|name| match obj.get(*name)? {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    })
}

fn count(obj: &Map<String, Value>, names: &[&str]) -> Option<u64> {
    number(obj, names)
        .filter(|v| *v >= 0.0)
        .map(|v| v.round() as u64)
}

fn flag(obj: &Map<String, Value>, names: &[&str]) -> Option<bool> {
    names.iter().find_map(|name| match obj.get(*name)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().and_then(|i| match i {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

fn text(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match obj.get(*name)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

/// Fields available straight from discovery, before any provider fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuickFields {
    pub price_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub volume_24h: Option<f64>,
    pub market_cap: Option<f64>,
    pub price_change_24h: Option<f64>,
    pub holder_count: Option<u64>,
    pub txns_24h: Option<u64>,
    pub age_hours: Option<f64>,
}

impl QuickFields {
    /// Names accepted by [`QuickFields::tracked_value`]; used for change detection.
    pub const TRACKABLE: [&'static str; 7] = [
        "price_usd",
        "liquidity_usd",
        "volume_24h",
        "market_cap",
        "price_change_24h",
        "holder_count",
        "txns_24h",
    ];

    pub fn from_json(obj: &Map<String, Value>) -> Self {
        Self {
            price_usd: number(obj, &["price_usd", "priceUsd", "price"]),
            liquidity_usd: number(obj, &["liquidity_usd", "liquidityUsd", "liquidity"]),
            volume_24h: number(obj, &["volume_24h", "volume24h", "v24hUSD"]),
            market_cap: number(obj, &["market_cap", "marketCap", "mc", "fdv"]),
            price_change_24h: number(
                obj,
                &["price_change_24h", "priceChange24h", "v24hChangePercent"],
            ),
            holder_count: count(obj, &["holder_count", "holderCount", "holders"]),
            txns_24h: count(obj, &["txns_24h", "txns24h", "trade24h"]),
            age_hours: number(obj, &["age_hours", "ageHours"]),
        }
    }

    pub fn tracked_value(&self, name: &str) -> Option<f64> {
        match name {
            "price_usd" => self.price_usd,
            "liquidity_usd" => self.liquidity_usd,
            "volume_24h" => self.volume_24h,
            "market_cap" => self.market_cap,
            "price_change_24h" => self.price_change_24h,
            "holder_count" => self.holder_count.map(|v| v as f64),
            "txns_24h" => self.txns_24h.map(|v| v as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceFields {
    pub price_usd: Option<f64>,
    pub price_change_5m: Option<f64>,
    pub price_change_1h: Option<f64>,
    pub price_change_24h: Option<f64>,
}

impl PriceFields {
    pub fn from_json(obj: &Map<String, Value>) -> Self {
        Self {
            price_usd: number(obj, &["price_usd", "priceUsd", "price", "value"]),
            price_change_5m: number(obj, &["price_change_5m", "priceChange5m"]),
            price_change_1h: number(obj, &["price_change_1h", "priceChange1h"]),
            price_change_24h: number(obj, &["price_change_24h", "priceChange24h"]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeFields {
    pub volume_1h: Option<f64>,
    pub volume_24h: Option<f64>,
    pub buys_1h: Option<u64>,
    pub sells_1h: Option<u64>,
    pub unique_wallets_24h: Option<u64>,
    pub wallet_change_24h_pct: Option<f64>,
    pub largest_trade_usd_1h: Option<f64>,
}

impl VolumeFields {
    pub fn from_json(obj: &Map<String, Value>) -> Self {
        Self {
            volume_1h: number(obj, &["volume_1h", "volume1h", "v1hUSD"]),
            volume_24h: number(obj, &["volume_24h", "volume24h", "v24hUSD"]),
            buys_1h: count(obj, &["buys_1h", "buys1h", "buy1h"]),
            sells_1h: count(obj, &["sells_1h", "sells1h", "sell1h"]),
            unique_wallets_24h: count(obj, &["unique_wallets_24h", "uniqueWallet24h"]),
            wallet_change_24h_pct: number(
                obj,
                &["wallet_change_24h_pct", "uniqueWallet24hChangePercent"],
            ),
            largest_trade_usd_1h: number(obj, &["largest_trade_usd_1h", "largestTrade1hUSD"]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HolderFields {
    pub holder_count: Option<u64>,
    pub top10_holder_pct: Option<f64>,
    pub creator_holding_pct: Option<f64>,
}

impl HolderFields {
    pub fn from_json(obj: &Map<String, Value>) -> Self {
        Self {
            holder_count: count(obj, &["holder_count", "holderCount", "holders"]),
            top10_holder_pct: number(obj, &["top10_holder_pct", "top10HolderPercent"]),
            creator_holding_pct: number(obj, &["creator_holding_pct", "creatorPercentage"]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFields {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub creator: Option<String>,
    /// Unix seconds
    pub created_at: Option<u64>,
    pub website: Option<String>,
    pub twitter: Option<String>,
    pub telegram: Option<String>,
}

impl MetadataFields {
    pub fn from_json(obj: &Map<String, Value>) -> Self {
        Self {
            name: text(obj, &["name"]),
            symbol: text(obj, &["symbol"]),
            creator: text(obj, &["creator", "creatorAddress", "deployer"]),
            created_at: count(obj, &["created_at", "createdAt", "creationTime"]),
            website: text(obj, &["website"]),
            twitter: text(obj, &["twitter"]),
            telegram: text(obj, &["telegram"]),
        }
    }

    pub fn social_count(&self) -> usize {
        [&self.website, &self.twitter, &self.telegram]
            .iter()
            .filter(|s| s.is_some())
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityFields {
    pub mint_authority_revoked: Option<bool>,
    pub freeze_authority_revoked: Option<bool>,
    pub lp_burned_pct: Option<f64>,
    pub is_mutable: Option<bool>,
    pub transfer_fee_bps: Option<u64>,
    pub is_honeypot: Option<bool>,
}

impl SecurityFields {
    pub fn from_json(obj: &Map<String, Value>) -> Self {
        Self {
            mint_authority_revoked: flag(
                obj,
                &["mint_authority_revoked", "mintAuthorityRevoked"],
            ),
            freeze_authority_revoked: flag(
                obj,
                &["freeze_authority_revoked", "freezeAuthorityRevoked"],
            ),
            lp_burned_pct: number(obj, &["lp_burned_pct", "lpBurnedPercent", "lpBurned"]),
            is_mutable: flag(obj, &["is_mutable", "mutableMetadata"]),
            transfer_fee_bps: count(obj, &["transfer_fee_bps", "transferFeeBps"]),
            is_honeypot: flag(obj, &["is_honeypot", "isHoneypot"]),
        }
    }

    pub fn authorities_revoked(&self) -> bool {
        self.mint_authority_revoked == Some(true) && self.freeze_authority_revoked == Some(true)
    }
}

/// A decoded provider record, tagged by the category it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldRecord {
    Price(PriceFields),
    Volume(VolumeFields),
    Holders(HolderFields),
    Metadata(MetadataFields),
    Security(SecurityFields),
}

impl FieldRecord {
    /// Decode a raw provider payload for `category`.
    ///
    /// Returns `None` only when the payload is not a JSON object at all.
    pub fn decode(category: FieldCategory, raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        Some(match category {
            FieldCategory::Price => FieldRecord::Price(PriceFields::from_json(obj)),
            FieldCategory::Volume => FieldRecord::Volume(VolumeFields::from_json(obj)),
            FieldCategory::Holders => FieldRecord::Holders(HolderFields::from_json(obj)),
            FieldCategory::Metadata => FieldRecord::Metadata(MetadataFields::from_json(obj)),
            FieldCategory::Security => FieldRecord::Security(SecurityFields::from_json(obj)),
        })
    }

    pub fn category(&self) -> FieldCategory {
        match self {
            FieldRecord::Price(_) => FieldCategory::Price,
            FieldRecord::Volume(_) => FieldCategory::Volume,
            FieldRecord::Holders(_) => FieldCategory::Holders,
            FieldRecord::Metadata(_) => FieldCategory::Metadata,
            FieldRecord::Security(_) => FieldCategory::Security,
        }
    }
}

/// Typed field bag of a candidate, grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldBag {
    pub quick: QuickFields,
    pub price: Option<PriceFields>,
    pub volume: Option<VolumeFields>,
    pub holders: Option<HolderFields>,
    pub metadata: Option<MetadataFields>,
    pub security: Option<SecurityFields>,
}

impl FieldBag {
    pub fn new(quick: QuickFields) -> Self {
        Self {
            quick,
            ..Self::default()
        }
    }

    pub fn insert(&mut self, record: FieldRecord) {
        match record {
            FieldRecord::Price(f) => self.price = Some(f),
            FieldRecord::Volume(f) => self.volume = Some(f),
            FieldRecord::Holders(f) => self.holders = Some(f),
            FieldRecord::Metadata(f) => self.metadata = Some(f),
            FieldRecord::Security(f) => self.security = Some(f),
        }
    }

    pub fn has(&self, category: FieldCategory) -> bool {
        match category {
            FieldCategory::Price => self.price.is_some(),
            FieldCategory::Volume => self.volume.is_some(),
            FieldCategory::Holders => self.holders.is_some(),
            FieldCategory::Metadata => self.metadata.is_some(),
            FieldCategory::Security => self.security.is_some(),
        }
    }

    /// Best-known 24h volume, preferring fetched data over the discovery seed.
    pub fn volume_24h(&self) -> Option<f64> {
        self.volume
            .as_ref()
            .and_then(|v| v.volume_24h)
            .or(self.quick.volume_24h)
    }

    /// Best-known holder count, preferring fetched data over the discovery seed.
    pub fn holder_count(&self) -> Option<u64> {
        self.holders
            .as_ref()
            .and_then(|h| h.holder_count)
            .or(self.quick.holder_count)
    }

    pub fn price_change_24h(&self) -> Option<f64> {
        self.price
            .as_ref()
            .and_then(|p| p.price_change_24h)
            .or(self.quick.price_change_24h)
    }
}
