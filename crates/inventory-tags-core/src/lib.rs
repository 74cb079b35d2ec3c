use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub type TagId = i64;

/// Returned by [`next_available_letter`] once every letter A-Z is taken.
pub const LETTERS_EXHAUSTED: &str = "??";
pub const FRACTIONING_FIELD: &str = "FRACTIONING";
pub const ARCHIVE_RESET_FIELD: &str = "ARCHIVE_RESET";
pub const RECEIVING_FIELD: &str = "RECEIVING";

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum InventoryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(
        "conservation error: tag {tag_id} cannot commit {requested}kg, remaining saldo is {saldo}kg"
    )]
    Conservation {
        tag_id: TagId,
        requested: Decimal,
        saldo: Decimal,
    },
    #[error("duplicate letter: {letter} is already used on tag {tag_id}")]
    DuplicateLetter { tag_id: TagId, letter: String },
    #[error("storage unavailable after {completed_steps} completed step(s): {reason}")]
    StorageUnavailable {
        reason: String,
        completed_steps: usize,
    },
    #[error(
        "partial archive failure: {} archived, {} failed",
        .0.archived.len(),
        .0.failures.len()
    )]
    PartialArchiveFailure(ArchiveReport),
    #[error(
        "save interrupted after {completed_steps} completed step(s): archiving failed for tags {:?}",
        .report.failed_ids()
    )]
    SaveInterrupted {
        completed_steps: usize,
        saved: SaveOutcome,
        report: ArchiveReport,
    },
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: i64 },
    #[error("permission denied: {actor} may not {operation}")]
    PermissionDenied { actor: String, operation: String },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl InventoryError {
    #[must_use]
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            reason: reason.into(),
            completed_steps: 0,
        }
    }

    /// Records how many sequential steps had committed before a storage
    /// failure or an interrupted save. Other kinds are returned unchanged.
    #[must_use]
    pub fn after_steps(self, steps: usize) -> Self {
        match self {
            Self::StorageUnavailable {
                reason,
                completed_steps,
            } => Self::StorageUnavailable {
                reason,
                completed_steps: completed_steps + steps,
            },
            Self::SaveInterrupted {
                completed_steps,
                saved,
                report,
            } => Self::SaveInterrupted {
                completed_steps: completed_steps + steps,
                saved,
                report,
            },
            other => other,
        }
    }

    /// User-input problems the presentation layer can ask the user to fix.
    #[must_use]
    pub fn is_recoverable_input(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Conservation { .. } | Self::DuplicateLetter { .. }
        )
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Tag,
    Subtag,
    Order,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::Subtag => "subtag",
            Self::Order => "order",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tag" => Some(Self::Tag),
            "subtag" => Some(Self::Subtag),
            "order" => Some(Self::Order),
            _ => None,
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical form of a controlled-vocabulary value: decoration stripped,
/// separators collapsed to single spaces, upper case.
#[must_use]
pub fn normalize_vocabulary(raw: &str) -> String {
    raw.chars()
        .map(|c| if c == '_' || c == '-' { ' ' } else { c })
        .filter(|c| c.is_alphabetic() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TagStatus {
    Free,
    Open,
    Reserved,
    Quoted,
    Generated,
}

impl TagStatus {
    pub const ALL: [Self; 5] = [
        Self::Free,
        Self::Open,
        Self::Reserved,
        Self::Quoted,
        Self::Generated,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Open => "open",
            Self::Reserved => "reserved",
            Self::Quoted => "quoted",
            Self::Generated => "generated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Self::Free),
            "open" => Some(Self::Open),
            "reserved" => Some(Self::Reserved),
            "quoted" => Some(Self::Quoted),
            "generated" => Some(Self::Generated),
            _ => None,
        }
    }

    /// Decodes a stored or user-entered label. Accepts any casing, decorated
    /// text and the legacy Portuguese labels; a missing or blank value is Free.
    #[must_use]
    pub fn from_label(raw: Option<&str>) -> Option<Self> {
        let Some(raw) = raw else {
            return Some(Self::Free);
        };

        match normalize_vocabulary(raw).as_str() {
            "" | "NONE" | "FREE" | "LIVRE" => Some(Self::Free),
            "OPEN" | "ABERTO" => Some(Self::Open),
            "RESERVED" | "RESERVADO" => Some(Self::Reserved),
            "QUOTED" | "ORÇAMENTO" | "ORCAMENTO" => Some(Self::Quoted),
            "GENERATED" | "GERADO" => Some(Self::Generated),
            _ => None,
        }
    }
}

impl Display for TagStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Generated,
    Pending,
    NotGenerated,
    Cancelled,
    Delivered,
    Quoted,
    Reserved,
}

impl OrderStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::Pending => "pending",
            Self::NotGenerated => "not_generated",
            Self::Cancelled => "cancelled",
            Self::Delivered => "delivered",
            Self::Quoted => "quoted",
            Self::Reserved => "reserved",
        }
    }

    #[must_use]
    pub fn from_label(raw: &str) -> Option<Self> {
        match normalize_vocabulary(raw).as_str() {
            "GENERATED" | "GERADO" => Some(Self::Generated),
            "PENDING" | "PENDENTE" => Some(Self::Pending),
            "NOT GENERATED" | "NÃO GERADO" | "NAO GERADO" => Some(Self::NotGenerated),
            "CANCELLED" | "CANCELED" | "CANCELADO" => Some(Self::Cancelled),
            "DELIVERED" | "ENTREGUE" => Some(Self::Delivered),
            "QUOTED" | "ORÇAMENTO" | "ORCAMENTO" => Some(Self::Quoted),
            "RESERVED" | "RESERVADO" => Some(Self::Reserved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    ToArrange,
    Pix,
    Boleto,
    Card,
}

impl PaymentMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToArrange => "to_arrange",
            Self::Pix => "pix",
            Self::Boleto => "boleto",
            Self::Card => "card",
        }
    }

    #[must_use]
    pub fn from_label(raw: &str) -> Option<Self> {
        match normalize_vocabulary(raw).as_str() {
            "TO ARRANGE" | "A COMBINAR" => Some(Self::ToArrange),
            "PIX" => Some(Self::Pix),
            "BOLETO" => Some(Self::Boleto),
            "CARD" | "CARTÃO" | "CARTAO" => Some(Self::Card),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Operator,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Operator => "operator",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "viewer" => Some(Self::Viewer),
            "operator" => Some(Self::Operator),
            _ => None,
        }
    }

    #[must_use]
    pub fn can_mutate(self) -> bool {
        matches!(self, Self::Operator)
    }
}

/// Identity attached to every audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub name: String,
    pub role: Role,
}

impl Actor {
    #[must_use]
    pub fn operator(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Role::Operator,
        }
    }

    #[must_use]
    pub fn viewer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Role::Viewer,
        }
    }
}

/// Status values and who may change them. No pair of states is structurally
/// forbidden; restriction is by role only.
pub struct StatusWorkflow;

impl StatusWorkflow {
    const DISPLAY_ORDER: [TagStatus; 5] = [
        TagStatus::Free,
        TagStatus::Reserved,
        TagStatus::Quoted,
        TagStatus::Generated,
        TagStatus::Open,
    ];

    #[must_use]
    pub fn statuses() -> &'static [TagStatus] {
        &Self::DISPLAY_ORDER
    }

    #[must_use]
    pub const fn can_transition(_from: TagStatus, _to: TagStatus) -> bool {
        true
    }

    #[must_use]
    pub fn is_terminal(status: TagStatus) -> bool {
        status == TagStatus::Generated
    }

    #[must_use]
    pub fn allows_fractioning(status: TagStatus) -> bool {
        status == TagStatus::Open
    }

    /// Checks that `actor` may invoke a mutating operation.
    ///
    /// # Errors
    /// Returns [`InventoryError::Validation`] for a blank actor name and
    /// [`InventoryError::PermissionDenied`] for read-only roles.
    pub fn authorize_mutation(actor: &Actor, operation: &str) -> Result<(), InventoryError> {
        if actor.name.trim().is_empty() {
            return Err(InventoryError::Validation(
                "actor MUST be provided for every write".to_string(),
            ));
        }

        if !actor.role.can_mutate() {
            return Err(InventoryError::PermissionDenied {
                actor: actor.name.clone(),
                operation: operation.to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub id: TagId,
    pub caliber: Option<String>,
    pub weight: Decimal,
    pub client: Option<String>,
    pub supplier: Option<String>,
    #[serde(default, with = "iso_date::option")]
    pub expiry: Option<Date>,
    pub status: TagStatus,
    pub reference_number: Option<String>,
}

impl Tag {
    /// The field set a tag id carries while unassigned.
    #[must_use]
    pub fn empty(id: TagId) -> Self {
        Self {
            id,
            caliber: None,
            weight: Decimal::ZERO,
            client: None,
            supplier: None,
            expiry: None,
            status: TagStatus::Free,
            reference_number: None,
        }
    }

    #[must_use]
    pub fn is_empty_slot(&self) -> bool {
        self.status == TagStatus::Free && self.weight.is_zero()
    }

    /// A patch that carries every field of this tag, used by receiving.
    #[must_use]
    pub fn as_full_patch(&self) -> TagPatch {
        TagPatch {
            id: self.id,
            caliber: Some(self.caliber.clone().unwrap_or_default()),
            weight: Some(self.weight),
            client: Some(self.client.clone().unwrap_or_default()),
            supplier: Some(self.supplier.clone().unwrap_or_default()),
            expiry: Some(self.expiry),
            status: Some(self.status),
            reference_number: Some(self.reference_number.clone().unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subtag {
    pub tag_id: TagId,
    pub letter: String,
    pub client: String,
    pub weight: Decimal,
    pub status: TagStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubtagInput {
    pub tag_id: TagId,
    pub letter: String,
    pub client: String,
    pub weight: Decimal,
    pub status: TagStatus,
}

impl SubtagInput {
    /// Validates the request shape and returns it with the letter upper-cased
    /// and the client trimmed. Performs no storage reads.
    ///
    /// # Errors
    /// Returns [`InventoryError::Validation`] for a non-positive or oversized
    /// weight, a letter that is not a single ASCII letter, or a blank client.
    pub fn normalized(&self, config: &EngineConfig) -> Result<Self, InventoryError> {
        if self.weight <= Decimal::ZERO {
            return Err(InventoryError::Validation(format!(
                "subtag weight MUST be > 0, got {}",
                self.weight
            )));
        }

        if let Some(max) = config.max_subtag_weight {
            if self.weight > max {
                return Err(InventoryError::Validation(format!(
                    "subtag weight MUST be <= {max}, got {}",
                    self.weight
                )));
            }
        }

        let letter = self.letter.trim().to_ascii_uppercase();
        let mut chars = letter.chars();
        let single_letter = matches!(
            (chars.next(), chars.next()),
            (Some(first), None) if first.is_ascii_alphabetic()
        );
        if !single_letter {
            return Err(InventoryError::Validation(format!(
                "letter MUST be a single character A-Z, got {:?}",
                self.letter
            )));
        }

        let client = self.client.trim().to_string();
        if client.is_empty() {
            return Err(InventoryError::Validation(
                "subtag destination client MUST be provided".to_string(),
            ));
        }

        Ok(Self {
            tag_id: self.tag_id,
            letter,
            client,
            weight: self.weight,
            status: self.status,
        })
    }
}

/// Letters and weight already committed to subtags of one tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Consumption {
    pub used_letters: BTreeSet<String>,
    pub used_weight: Decimal,
}

impl Consumption {
    #[must_use]
    pub fn contains_letter(&self, letter: &str) -> bool {
        let wanted = letter.trim().to_ascii_uppercase();
        self.used_letters
            .iter()
            .any(|used| used.trim().to_ascii_uppercase() == wanted)
    }

    /// Remaining uncommitted weight, floored at zero.
    #[must_use]
    pub fn saldo(&self, tag_weight: Decimal) -> Decimal {
        (tag_weight - self.used_weight).max(Decimal::ZERO)
    }
}

/// First letter A-Z not present in `used` (case-insensitive), or
/// [`LETTERS_EXHAUSTED`].
#[must_use]
pub fn next_available_letter(used: &BTreeSet<String>) -> String {
    let taken: BTreeSet<String> = used
        .iter()
        .map(|letter| letter.trim().to_ascii_uppercase())
        .collect();

    ('A'..='Z')
        .map(String::from)
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| LETTERS_EXHAUSTED.to_string())
}

/// Verifies that committing `requested` more kilograms keeps the sum of
/// subtag weights within the tag weight plus `tolerance`.
///
/// # Errors
/// Returns [`InventoryError::Conservation`] when the request exceeds saldo.
pub fn check_conservation(
    tag_id: TagId,
    tag_weight: Decimal,
    consumption: &Consumption,
    requested: Decimal,
    tolerance: Decimal,
) -> Result<(), InventoryError> {
    let saldo = tag_weight - consumption.used_weight;
    if requested > saldo + tolerance {
        return Err(InventoryError::Conservation {
            tag_id,
            requested,
            saldo: saldo.max(Decimal::ZERO),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TagField {
    Caliber,
    Weight,
    Client,
    Supplier,
    Expiry,
    Status,
    ReferenceNumber,
}

impl TagField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Caliber => "caliber",
            Self::Weight => "weight",
            Self::Client => "client",
            Self::Supplier => "supplier",
            Self::Expiry => "expiry",
            Self::Status => "status",
            Self::ReferenceNumber => "reference_number",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "caliber" | "calibre" => Some(Self::Caliber),
            "weight" | "peso" => Some(Self::Weight),
            "client" | "cliente" => Some(Self::Client),
            "supplier" | "fornecedor" => Some(Self::Supplier),
            "expiry" | "validade" => Some(Self::Expiry),
            "status" => Some(Self::Status),
            "reference_number" | "nr" | "nr_pedido" => Some(Self::ReferenceNumber),
            _ => None,
        }
    }
}

/// Requested changes to one tag. `None` leaves a field untouched; an empty
/// string clears a text field and `Some(None)` clears the expiry.
#[allow(clippy::option_option)]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagPatch {
    pub id: TagId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caliber: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
    #[serde(
        default,
        with = "expiry_change",
        skip_serializing_if = "Option::is_none"
    )]
    pub expiry: Option<Option<Date>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TagStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_number: Option<String>,
}

/// Serde for a patch expiry: an absent key leaves it untouched, `null`
/// clears it.
mod expiry_change {
    use serde::{Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(
        value: &Option<Option<Date>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(Some(date)) => super::iso_date::serialize(date, serializer),
            _ => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<Date>>, D::Error> {
        super::iso_date::option::deserialize(deserializer).map(Some)
    }
}

impl TagPatch {
    #[must_use]
    pub fn new(id: TagId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        [
            self.caliber.is_some(),
            self.weight.is_some(),
            self.client.is_some(),
            self.supplier.is_some(),
            self.expiry.is_some(),
            self.status.is_some(),
            self.reference_number.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.field_count() == 0
    }

    /// Translates a presentation-layer field map into a typed patch.
    ///
    /// # Errors
    /// Returns [`InventoryError::Validation`] for unknown field names or
    /// values that cannot be parsed.
    pub fn from_fields(id: TagId, fields: &BTreeMap<String, String>) -> Result<Self, InventoryError> {
        let mut patch = Self::new(id);
        for (name, value) in fields {
            let field = TagField::parse(name).ok_or_else(|| {
                InventoryError::Validation(format!("unknown tag field: {name}"))
            })?;
            match field {
                TagField::Caliber => patch.caliber = Some(value.clone()),
                TagField::Weight => patch.weight = Some(parse_weight(value)?),
                TagField::Client => patch.client = Some(value.clone()),
                TagField::Supplier => patch.supplier = Some(value.clone()),
                TagField::Expiry => {
                    patch.expiry = if value.trim().is_empty() {
                        Some(None)
                    } else {
                        Some(Some(parse_date(value)?))
                    };
                }
                TagField::Status => {
                    patch.status = Some(TagStatus::from_label(Some(value)).ok_or_else(|| {
                        InventoryError::Validation(format!("unknown tag status: {value}"))
                    })?);
                }
                TagField::ReferenceNumber => patch.reference_number = Some(value.clone()),
            }
        }
        Ok(patch)
    }

    /// # Errors
    /// Returns [`InventoryError::Validation`] when the patch carries a
    /// negative weight or a non-positive id.
    pub fn validate(&self) -> Result<(), InventoryError> {
        if self.id <= 0 {
            return Err(InventoryError::Validation(format!(
                "tag id MUST be > 0, got {}",
                self.id
            )));
        }
        if let Some(weight) = self.weight {
            if weight < Decimal::ZERO {
                return Err(InventoryError::Validation(format!(
                    "tag weight MUST be >= 0, got {weight}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub id: i64,
    pub client_name: String,
    pub status: OrderStatus,
    pub payment: PaymentMethod,
    pub reference_number: Option<String>,
    pub observation: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OrderField {
    Status,
    Payment,
    ReferenceNumber,
    Observation,
}

impl OrderField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Payment => "payment",
            Self::ReferenceNumber => "reference_number",
            Self::Observation => "observation",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "status" => Some(Self::Status),
            "payment" | "pagamento" => Some(Self::Payment),
            "reference_number" | "nr" | "nr_pedido" => Some(Self::ReferenceNumber),
            "observation" | "observação" | "observacao" | "obs" => Some(Self::Observation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderPatch {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
}

impl OrderPatch {
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.payment.is_none()
            && self.reference_number.is_none()
            && self.observation.is_none()
    }

    /// # Errors
    /// Returns [`InventoryError::Validation`] for unknown fields or values
    /// outside the controlled vocabularies.
    pub fn from_fields(id: i64, fields: &BTreeMap<String, String>) -> Result<Self, InventoryError> {
        let mut patch = Self::new(id);
        for (name, value) in fields {
            let field = OrderField::parse(name).ok_or_else(|| {
                InventoryError::Validation(format!("unknown order field: {name}"))
            })?;
            match field {
                OrderField::Status => {
                    patch.status = Some(OrderStatus::from_label(value).ok_or_else(|| {
                        InventoryError::Validation(format!("unknown order status: {value}"))
                    })?);
                }
                OrderField::Payment => {
                    patch.payment = Some(PaymentMethod::from_label(value).ok_or_else(|| {
                        InventoryError::Validation(format!("unknown payment method: {value}"))
                    })?);
                }
                OrderField::ReferenceNumber => patch.reference_number = Some(value.clone()),
                OrderField::Observation => patch.observation = Some(value.clone()),
            }
        }
        Ok(patch)
    }
}

/// The entity a patch addresses; this is the `entity_kind` of a diff write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPatch {
    Tag(TagPatch),
    Order(OrderPatch),
}

impl EntityPatch {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Tag(_) => EntityKind::Tag,
            Self::Order(_) => EntityKind::Order,
        }
    }

    #[must_use]
    pub fn id(&self) -> i64 {
        match self {
            Self::Tag(patch) => patch.id,
            Self::Order(patch) => patch.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

/// Result of comparing a candidate patch against the persisted row: only the
/// fields that differ are kept in `staged`, one [`FieldChange`] per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDiff<P> {
    pub staged: P,
    pub changes: Vec<FieldChange>,
    pub dropped_write_once: bool,
}

fn normalize_text(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

fn stage_text(
    field: &str,
    current: Option<&str>,
    candidate: Option<&String>,
    changes: &mut Vec<FieldChange>,
) -> Option<String> {
    let candidate = normalize_text(candidate.map(String::as_str));
    let current = normalize_text(current);
    if candidate == current {
        return None;
    }
    changes.push(FieldChange {
        field: field.to_string(),
        old_value: current,
        new_value: candidate.clone(),
    });
    Some(candidate)
}

fn stage_write_once(
    field: &str,
    current: Option<&str>,
    candidate: Option<&String>,
    changes: &mut Vec<FieldChange>,
    dropped: &mut bool,
) -> Option<String> {
    candidate?;
    if !normalize_text(current).is_empty() {
        *dropped = true;
        return None;
    }
    stage_text(field, current, candidate, changes)
}

fn stage_value<T: PartialEq + Copy>(
    field: &str,
    current: T,
    candidate: Option<T>,
    render: impl Fn(T) -> String,
    changes: &mut Vec<FieldChange>,
) -> Option<T> {
    let candidate = candidate?;
    if candidate == current {
        return None;
    }
    changes.push(FieldChange {
        field: field.to_string(),
        old_value: render(current),
        new_value: render(candidate),
    });
    Some(candidate)
}

/// Stages the fields of `candidate` that differ from `current`.
/// `reference_number` is write-once: once non-empty, candidates for it are
/// dropped and `dropped_write_once` is set.
#[must_use]
pub fn diff_tag(current: &Tag, candidate: &TagPatch) -> StagedDiff<TagPatch> {
    let mut changes = Vec::new();
    let mut dropped_write_once = false;
    let mut staged = TagPatch::new(current.id);

    if candidate.caliber.is_some() {
        staged.caliber = stage_text(
            TagField::Caliber.as_str(),
            current.caliber.as_deref(),
            candidate.caliber.as_ref(),
            &mut changes,
        );
    }
    staged.weight = stage_value(
        TagField::Weight.as_str(),
        current.weight,
        candidate.weight,
        format_weight,
        &mut changes,
    );
    if candidate.client.is_some() {
        staged.client = stage_text(
            TagField::Client.as_str(),
            current.client.as_deref(),
            candidate.client.as_ref(),
            &mut changes,
        );
    }
    if candidate.supplier.is_some() {
        staged.supplier = stage_text(
            TagField::Supplier.as_str(),
            current.supplier.as_deref(),
            candidate.supplier.as_ref(),
            &mut changes,
        );
    }
    if let Some(expiry) = candidate.expiry {
        if current.expiry != expiry {
            changes.push(FieldChange {
                field: TagField::Expiry.as_str().to_string(),
                old_value: current.expiry.map(format_date).unwrap_or_default(),
                new_value: expiry.map(format_date).unwrap_or_default(),
            });
            staged.expiry = Some(expiry);
        }
    }
    staged.status = stage_value(
        TagField::Status.as_str(),
        current.status,
        candidate.status,
        |status| status.as_str().to_string(),
        &mut changes,
    );
    staged.reference_number = stage_write_once(
        TagField::ReferenceNumber.as_str(),
        current.reference_number.as_deref(),
        candidate.reference_number.as_ref(),
        &mut changes,
        &mut dropped_write_once,
    );

    StagedDiff {
        staged,
        changes,
        dropped_write_once,
    }
}

/// Order counterpart of [`diff_tag`]; the order reference number is the
/// write-once field.
#[must_use]
pub fn diff_order(current: &Order, candidate: &OrderPatch) -> StagedDiff<OrderPatch> {
    let mut changes = Vec::new();
    let mut dropped_write_once = false;
    let mut staged = OrderPatch::new(current.id);

    staged.status = stage_value(
        OrderField::Status.as_str(),
        current.status,
        candidate.status,
        |status| status.as_str().to_string(),
        &mut changes,
    );
    staged.payment = stage_value(
        OrderField::Payment.as_str(),
        current.payment,
        candidate.payment,
        |payment| payment.as_str().to_string(),
        &mut changes,
    );
    staged.reference_number = stage_write_once(
        OrderField::ReferenceNumber.as_str(),
        current.reference_number.as_deref(),
        candidate.reference_number.as_ref(),
        &mut changes,
        &mut dropped_write_once,
    );
    if candidate.observation.is_some() {
        staged.observation = stage_text(
            OrderField::Observation.as_str(),
            current.observation.as_deref(),
            candidate.observation.as_ref(),
            &mut changes,
        );
    }

    StagedDiff {
        staged,
        changes,
        dropped_write_once,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub entry_seq: i64,
    pub entry_id: Ulid,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub entity_kind: EntityKind,
    pub subject_id: i64,
    pub actor: String,
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntryInput {
    pub entity_kind: EntityKind,
    pub subject_id: i64,
    pub actor: String,
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

impl AuditEntryInput {
    #[must_use]
    pub fn from_change(kind: EntityKind, subject_id: i64, actor: &str, change: &FieldChange) -> Self {
        Self {
            entity_kind: kind,
            subject_id,
            actor: actor.to_string(),
            field: change.field.clone(),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
        }
    }

    /// # Errors
    /// Returns [`InventoryError::Validation`] when actor or field is blank.
    pub fn validate(&self) -> Result<(), InventoryError> {
        if self.actor.trim().is_empty() {
            return Err(InventoryError::Validation(
                "actor MUST be provided for every audit entry".to_string(),
            ));
        }
        if self.field.trim().is_empty() {
            return Err(InventoryError::Validation(
                "field MUST be provided for every audit entry".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub archive_seq: i64,
    pub tag: Tag,
    pub subtags: Vec<Subtag>,
    #[serde(with = "time::serde::rfc3339")]
    pub archived_at: OffsetDateTime,
    pub archived_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveFailure {
    pub tag_id: TagId,
    pub completed_steps: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveReport {
    pub archived: Vec<TagId>,
    pub failures: Vec<ArchiveFailure>,
}

impl ArchiveReport {
    #[must_use]
    pub fn failed_ids(&self) -> Vec<TagId> {
        self.failures.iter().map(|failure| failure.tag_id).collect()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What a batch of tag edits committed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveOutcome {
    pub applied_fields: usize,
    pub archived: Vec<TagId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub total: usize,
    pub by_status: BTreeMap<TagStatus, usize>,
    pub archived: usize,
}

impl StatusCounts {
    /// Builds counts from raw per-status tallies, filling absent statuses with zero.
    #[must_use]
    pub fn from_tallies(tallies: &BTreeMap<TagStatus, usize>, archived: usize) -> Self {
        let by_status: BTreeMap<TagStatus, usize> = TagStatus::ALL
            .iter()
            .map(|status| (*status, tallies.get(status).copied().unwrap_or(0)))
            .collect();
        Self {
            total: by_status.values().sum(),
            by_status,
            archived,
        }
    }

    #[must_use]
    pub fn count(&self, status: TagStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Live Generated tags plus everything already moved to history.
    #[must_use]
    pub fn generated_including_archive(&self) -> usize {
        self.count(TagStatus::Generated) + self.archived
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub cache_ttl_secs: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub busy_timeout_ms: u64,
    pub weight_tolerance: Decimal,
    pub max_subtag_weight: Option<Decimal>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            retry_attempts: 3,
            retry_backoff_ms: 200,
            busy_timeout_ms: 5_000,
            weight_tolerance: Decimal::new(1, 3),
            max_subtag_weight: None,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`InventoryError::Configuration`] when a field is out of bounds.
    pub fn validate(&self) -> Result<(), InventoryError> {
        if self.retry_attempts == 0 {
            return Err(InventoryError::Configuration(
                "retry_attempts MUST be >= 1".to_string(),
            ));
        }

        if self.retry_backoff_ms > 5_000 {
            return Err(InventoryError::Configuration(
                "retry_backoff_ms MUST be <= 5000".to_string(),
            ));
        }

        if self.weight_tolerance < Decimal::ZERO {
            return Err(InventoryError::Configuration(
                "weight_tolerance MUST be >= 0".to_string(),
            ));
        }

        if let Some(max) = self.max_subtag_weight {
            if max <= Decimal::ZERO {
                return Err(InventoryError::Configuration(
                    "max_subtag_weight MUST be > 0 when set".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON. Missing keys take
    /// their defaults.
    ///
    /// # Errors
    /// Returns [`InventoryError::Configuration`] when decoding fails or the
    /// decoded values violate bounds.
    pub fn from_json(value: &Value) -> Result<Self, InventoryError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            InventoryError::Configuration(format!("invalid engine config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Parses a weight in kilograms; a decimal comma is accepted.
///
/// # Errors
/// Returns [`InventoryError::Validation`] when the text is not a decimal.
pub fn parse_weight(raw: &str) -> Result<Decimal, InventoryError> {
    let cleaned = raw.trim().replace(',', ".");
    Decimal::from_str(&cleaned)
        .map_err(|err| InventoryError::Validation(format!("invalid weight {raw:?}: {err}")))
}

#[must_use]
pub fn format_weight(value: Decimal) -> String {
    value.normalize().to_string()
}

/// Parses `YYYY-MM-DD`, falling back to `DD/MM/YYYY`.
///
/// # Errors
/// Returns [`InventoryError::Validation`] when neither format matches.
pub fn parse_date(raw: &str) -> Result<Date, InventoryError> {
    let trimmed = raw.trim();
    Date::parse(trimmed, format_description!("[year]-[month]-[day]"))
        .or_else(|_| Date::parse(trimmed, format_description!("[day]/[month]/[year]")))
        .map_err(|err| InventoryError::Validation(format!("invalid date {raw:?}: {err}")))
}

#[must_use]
pub fn format_date(value: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        value.year(),
        u8::from(value.month()),
        value.day()
    )
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`InventoryError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, InventoryError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| InventoryError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(InventoryError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`InventoryError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, InventoryError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            InventoryError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
