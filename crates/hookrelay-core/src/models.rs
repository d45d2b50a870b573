//! Core domain models and strongly-typed identifiers.
//!
//! Defines projects, endpoints, sources, subscriptions, events, event
//! deliveries, and delivery attempts, plus newtype ID wrappers for
//! compile-time type safety. Includes database serialization traits and the
//! state vocabulary for the delivery pipeline.

use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Declares a UUID-backed identifier newtype with database and wire support.
///
/// Each id type is distinct at compile time so an `EndpointId` can never be
/// passed where a `DeliveryId` is expected, while sharing one storage
/// representation (Postgres `uuid`, including `uuid[]` columns).
macro_rules! uuid_id {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new time-ordered identifier (UUID v7).
            ///
            /// Lexicographic id order matches creation order, which is what
            /// cursor pagination and FIFO claiming sort on.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl sqlx::postgres::PgHasArrayType for $name {
            fn array_type_info() -> PgTypeInfo {
                <Uuid as sqlx::postgres::PgHasArrayType>::array_type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Identifier of a project, the multi-tenant boundary.
    ProjectId
}

uuid_id! {
    /// Identifier of an ingest source within an incoming project.
    SourceId
}

uuid_id! {
    /// Identifier of a consumer endpoint.
    EndpointId
}

uuid_id! {
    /// Identifier of a subscription binding an event stream to an endpoint.
    SubscriptionId
}

uuid_id! {
    /// Identifier of an ingested event. Events are immutable once created.
    EventId
}

uuid_id! {
    /// Identifier of one (event, endpoint, subscription) delivery record.
    DeliveryId
}

/// Whether a project ingests through sources or directly by endpoint id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    /// Events arrive from external producers through configured sources.
    Incoming,
    /// Events are produced by the project owner and target endpoint ids.
    Outgoing,
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming => write!(f, "incoming"),
            Self::Outgoing => write!(f, "outgoing"),
        }
    }
}

impl sqlx::Type<PgDb> for ProjectType {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ProjectType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "incoming" => Ok(Self::Incoming),
            "outgoing" => Ok(Self::Outgoing),
            _ => Err(format!("invalid project type: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for ProjectType {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Backoff strategy for retry scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Constant delay between attempts.
    #[default]
    Linear,
    /// Delay doubles per attempt, capped at 24 hours.
    Exponential,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            _ => Err(format!("unsupported strategy: {s}")),
        }
    }
}

/// Endpoint lifecycle status.
///
/// `paused` endpoints leave deliveries in `scheduled`; `inactive` endpoints
/// cause deliveries to be discarded until reactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// Endpoint accepts deliveries.
    Active,
    /// Endpoint disabled, manually or by the circuit breaker.
    Inactive,
    /// Endpoint created but not yet verified.
    Pending,
    /// Deliveries are held without being discarded.
    Paused,
}

impl EndpointStatus {
    /// Whether the dispatcher may send to an endpoint in this status.
    pub const fn is_deliverable(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Pending => write!(f, "pending"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl sqlx::Type<PgDb> for EndpointStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EndpointStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "pending" => Ok(Self::Pending),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("invalid endpoint status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for EndpointStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Event delivery lifecycle status.
///
/// ```text
/// scheduled -> processing -> success
///          |              -> retry -> processing -> ...
///          |              -> failure
///          `-> discarded
/// ```
///
/// `success`, `failure`, and `discarded` are terminal: no attempt is
/// appended after the transition and no queue job remains for the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Created and queued; no worker has claimed it yet.
    Scheduled,
    /// A worker holds the delivery and an attempt is in flight.
    Processing,
    /// Last attempt failed retriably; waiting for `next_send_time`.
    Retry,
    /// Terminal: an attempt received a 2xx response.
    Success,
    /// Terminal: retries exhausted or a non-retriable response.
    Failure,
    /// Terminal: dropped without exhausting retries (endpoint inactive,
    /// deleted subscription, stale claim).
    Discarded,
}

impl DeliveryStatus {
    /// Whether the status permits no further transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Discarded)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Processing => write!(f, "processing"),
            Self::Retry => write!(f, "retry"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Discarded => write!(f, "discarded"),
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "processing" => Ok(Self::Processing),
            "retry" => Ok(Self::Retry),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "discarded" => Ok(Self::Discarded),
            _ => Err(format!("invalid delivery status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Origin of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// Created through the REST surface.
    Api,
    /// Created by a CLI device stream.
    Cli,
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api => write!(f, "api"),
            Self::Cli => write!(f, "cli"),
        }
    }
}

impl sqlx::Type<PgDb> for SubscriptionType {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SubscriptionType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "api" => Ok(Self::Api),
            "cli" => Ok(Self::Cli),
            _ => Err(format!("invalid subscription type: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for SubscriptionType {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Hash algorithm for a signature version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashFn {
    /// HMAC-SHA256.
    #[default]
    Sha256,
    /// HMAC-SHA512.
    Sha512,
}

/// Output encoding for a signature version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SigEncoding {
    /// Lowercase hexadecimal.
    #[default]
    Hex,
    /// Standard base64 with padding.
    Base64,
}

/// One active signature version.
///
/// Versions are numbered by declaration order; all versions sign every
/// outbound request, which is what makes zero-downtime rotation possible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureVersion {
    /// Unique id of this version entry.
    pub uid: Uuid,
    /// Hash algorithm.
    pub hash: HashFn,
    /// Output encoding.
    pub encoding: SigEncoding,
    /// When this version was added.
    pub created_at: DateTime<Utc>,
}

/// Project-level signature configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// HTTP header carrying the signature value.
    pub header: String,
    /// Active versions, oldest first.
    pub versions: Vec<SignatureVersion>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            header: "X-Hookrelay-Signature".to_string(),
            versions: vec![SignatureVersion {
                uid: Uuid::new_v4(),
                hash: HashFn::Sha256,
                encoding: SigEncoding::Hex,
                created_at: Utc::now(),
            }],
        }
    }
}

/// Retry policy: strategy, base interval, and attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Backoff strategy.
    pub kind: StrategyKind,
    /// Base interval between attempts, in seconds.
    pub duration_seconds: u64,
    /// Maximum number of retries after the first attempt.
    pub retry_limit: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self { kind: StrategyKind::Linear, duration_seconds: 30, retry_limit: 3 }
    }
}

/// Fixed-window rate limit: `count` requests per `duration_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per window.
    pub count: u32,
    /// Window length in seconds.
    pub duration_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { count: 1000, duration_seconds: 60 }
    }
}

/// Circuit breaker policy: disable the endpoint after `count` consecutive
/// terminal failures within `threshold_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Consecutive terminal failures that trip the breaker.
    pub count: u32,
    /// Rolling window in which failures must accumulate.
    pub threshold_seconds: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self { count: 10, threshold_seconds: 3600 }
    }
}

/// Project configuration block consumed read-mostly by the delivery core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    /// Signature header and active versions.
    #[serde(default)]
    pub signature: SignatureConfig,
    /// Default retry policy for deliveries without subscription overrides.
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Default endpoint rate limit.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Days before soft-deleted events become eligible for hard deletion.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

/// Project: the multi-tenant boundary owning endpoints and subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    /// Unique identifier.
    pub id: ProjectId,
    /// Human-readable name.
    pub name: String,
    /// Ingest model: incoming (via sources) or outgoing (by endpoint id).
    pub project_type: ProjectType,
    /// Configuration block.
    pub config: sqlx::types::Json<ProjectConfig>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Soft delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A signing secret attached to an endpoint.
///
/// Expired secrets keep signing inside the grace window so receivers can
/// roll over without dropping verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSecret {
    /// Unique id of this secret entry.
    pub uid: Uuid,
    /// Secret material.
    pub value: String,
    /// When this secret was added.
    pub created_at: DateTime<Utc>,
    /// When this secret stops signing (plus grace).
    pub expires_at: Option<DateTime<Utc>>,
}

impl EndpointSecret {
    /// Whether this secret should still sign at `now` given a grace window.
    pub fn is_usable(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => now <= expires_at + grace,
        }
    }
}

/// Static authentication attached to outbound requests for an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointAuth {
    /// Send a fixed header with every request.
    ApiKey {
        /// Header name.
        header_name: String,
        /// Header value.
        header_value: String,
    },
}

/// Consumer endpoint: where deliveries are sent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Endpoint {
    /// Unique identifier.
    pub id: EndpointId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Human-readable name.
    pub name: String,
    /// Destination URL for deliveries.
    pub target_url: String,
    /// Active signing secrets, oldest first.
    pub secrets: sqlx::types::Json<Vec<EndpointSecret>>,
    /// Per-attempt HTTP timeout in seconds.
    pub http_timeout_seconds: i32,
    /// Requests allowed per rate-limit window.
    pub rate_limit: i32,
    /// Rate-limit window in seconds.
    pub rate_limit_duration_seconds: i32,
    /// Lifecycle status.
    pub status: EndpointStatus,
    /// Optional static authentication for outbound requests.
    pub auth: Option<sqlx::types::Json<EndpointAuth>>,
    /// Circuit breaker policy override.
    pub alert_config: Option<sqlx::types::Json<AlertConfig>>,
    /// Consecutive terminal failures since the last success.
    ///
    /// Persisted so the breaker survives restarts.
    pub breaker_failure_count: i32,
    /// Start of the current breaker window.
    pub breaker_window_started_at: Option<DateTime<Utc>>,
    /// Whether the breaker (rather than an operator) disabled the endpoint.
    pub disabled_by_breaker: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Soft delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Endpoint {
    /// Secrets that should sign an outbound request at `now`.
    pub fn usable_secrets(&self, now: DateTime<Utc>, grace: Duration) -> Vec<&EndpointSecret> {
        self.secrets.0.iter().filter(|s| s.is_usable(now, grace)).collect()
    }
}

/// Verification scheme for an ingest source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerifierConfig {
    /// HMAC over the raw request body.
    Hmac {
        /// Header carrying the producer's signature.
        header: String,
        /// Shared secret.
        secret: String,
        /// Hash algorithm.
        hash: HashFn,
        /// Signature encoding.
        encoding: SigEncoding,
    },
    /// HTTP basic authentication.
    BasicAuth {
        /// Expected username.
        username: String,
        /// Expected password.
        password: String,
    },
    /// Fixed API-key header.
    ApiKey {
        /// Header name.
        header_name: String,
        /// Expected header value.
        header_value: String,
    },
}

/// Ingest channel for an incoming project.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Source {
    /// Unique identifier.
    pub id: SourceId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Human-readable name.
    pub name: String,
    /// Provider type label (e.g. "http").
    pub source_type: String,
    /// Optional request verifier.
    pub verifier: Option<sqlx::types::Json<VerifierConfig>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Soft delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Header and body predicates of a subscription filter.
///
/// When `is_flattened` is set the stored predicates are already in dot-path
/// canonical form; otherwise they are flattened on read before evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SubscriptionFilter {
    /// Predicates over event headers.
    #[serde(default)]
    pub headers: serde_json::Value,
    /// Predicates over the event body.
    #[serde(default)]
    pub body: serde_json::Value,
    /// Whether predicates are stored pre-flattened.
    #[serde(default)]
    pub is_flattened: bool,
}

/// Filter configuration of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Event types this subscription accepts; `*` matches all.
    pub event_types: Vec<String>,
    /// Body/header predicates.
    #[serde(default)]
    pub filter: SubscriptionFilter,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { event_types: vec!["*".to_string()], filter: SubscriptionFilter::default() }
    }
}

/// Binding from a source or endpoint to delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    /// Unique identifier.
    pub id: SubscriptionId,
    /// How the subscription was created.
    pub sub_type: SubscriptionType,
    /// Owning project.
    pub project_id: ProjectId,
    /// Human-readable name.
    pub name: String,
    /// Target endpoint; `None` means broadcast (incoming projects).
    pub endpoint_id: Option<EndpointId>,
    /// Bound source (incoming projects).
    pub source_id: Option<SourceId>,
    /// Bound CLI device (cli subscriptions).
    pub device_id: Option<Uuid>,
    /// Event-type and predicate filters.
    pub filter_config: sqlx::types::Json<FilterConfig>,
    /// Circuit breaker override.
    pub alert_config: Option<sqlx::types::Json<AlertConfig>>,
    /// Retry policy override.
    pub retry_config: Option<sqlx::types::Json<StrategyConfig>>,
    /// Rate-limit override.
    pub rate_limit_config: Option<sqlx::types::Json<RateLimitConfig>>,
    /// Optional transformer script body, executed by an external service.
    pub function: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Soft delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A single immutable ingested message.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    /// Unique identifier.
    pub id: EventId,
    /// Producer-declared event type, matched against subscriptions.
    pub event_type: String,
    /// Owning project.
    pub project_id: ProjectId,
    /// Ingest source (incoming projects).
    pub source_id: Option<SourceId>,
    /// Endpoints resolved by the fan-out planner.
    pub endpoints: Vec<EndpointId>,
    /// Headers captured at ingest.
    pub headers: sqlx::types::Json<HashMap<String, String>>,
    /// Body exactly as received.
    pub raw: String,
    /// Canonicalised JSON body.
    pub data: sqlx::types::Json<serde_json::Value>,
    /// Query parameters captured at ingest.
    pub url_query_params: Option<String>,
    /// Client-supplied deduplication key.
    pub idempotency_key: Option<String>,
    /// Whether this event was recognised as a duplicate at ingest.
    pub is_duplicate_event: bool,
    /// When fan-out completed for this event.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Soft delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Headers as a plain map.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers.0
    }
}

/// Mutable bookkeeping attached to an event delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    /// Body to deliver (post-transform when a function is attached).
    pub data: serde_json::Value,
    /// Raw body copy for signing.
    pub raw: String,
    /// Backoff strategy in force.
    pub strategy: StrategyKind,
    /// Earliest time of the next attempt.
    pub next_send_time: DateTime<Utc>,
    /// Attempts made so far. Always equals the attempt-row count.
    pub num_trials: u32,
    /// Base interval in seconds for backoff computation.
    pub interval_seconds: u64,
    /// Maximum retries; `num_trials` never exceeds it.
    pub retry_limit: u32,
}

/// Durable intent to deliver one event to one endpoint under one
/// subscription.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventDelivery {
    /// Unique identifier.
    pub id: DeliveryId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Source event.
    pub event_id: EventId,
    /// Destination endpoint.
    pub endpoint_id: EndpointId,
    /// Subscription that matched the event.
    pub subscription_id: SubscriptionId,
    /// CLI device for cli subscriptions.
    pub device_id: Option<Uuid>,
    /// Headers to send (event headers plus custom headers).
    pub headers: sqlx::types::Json<HashMap<String, String>>,
    /// Query parameters forwarded to the endpoint.
    pub url_query_params: Option<String>,
    /// Copied from the event for listing filters.
    pub idempotency_key: Option<String>,
    /// Copied from the event for matching and outbound headers.
    pub event_type: String,
    /// Lifecycle status.
    pub status: DeliveryStatus,
    /// Attempt bookkeeping and retry policy snapshot.
    pub metadata: sqlx::types::Json<DeliveryMetadata>,
    /// Operator-facing note (e.g. discard reason).
    pub description: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Soft delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl EventDelivery {
    /// Attempt bookkeeping.
    pub fn metadata(&self) -> &DeliveryMetadata {
        &self.metadata.0
    }
}

/// Immutable record of one HTTP try for one delivery.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    /// Unique identifier.
    pub id: Uuid,
    /// Delivery this attempt belongs to.
    pub delivery_id: DeliveryId,
    /// Endpoint the attempt targeted.
    pub endpoint_id: EndpointId,
    /// Service version that made the attempt.
    pub api_version: String,
    /// Resolved client IP of the endpoint host, when known.
    pub ip_address: String,
    /// Headers sent with the request.
    pub request_http_header: sqlx::types::Json<HashMap<String, String>>,
    /// Headers received in the response.
    pub response_http_header: sqlx::types::Json<HashMap<String, String>>,
    /// HTTP status, `None` when the request never completed.
    pub http_status: Option<i32>,
    /// Response body, truncated.
    pub response_data: String,
    /// Error description for failed attempts.
    pub error: String,
    /// Whether the response was 2xx.
    pub status: bool,
    /// When the attempt was made.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_status_display_round_trips() {
        for status in [
            DeliveryStatus::Scheduled,
            DeliveryStatus::Processing,
            DeliveryStatus::Retry,
            DeliveryStatus::Success,
            DeliveryStatus::Failure,
            DeliveryStatus::Discarded,
        ] {
            assert_eq!(status.to_string().parse::<DeliveryStatus>().unwrap(), status);
        }
    }

    #[test]
    fn terminal_statuses_identified() {
        assert!(DeliveryStatus::Success.is_terminal());
        assert!(DeliveryStatus::Failure.is_terminal());
        assert!(DeliveryStatus::Discarded.is_terminal());
        assert!(!DeliveryStatus::Scheduled.is_terminal());
        assert!(!DeliveryStatus::Processing.is_terminal());
        assert!(!DeliveryStatus::Retry.is_terminal());
    }

    #[test]
    fn only_active_endpoints_are_deliverable() {
        assert!(EndpointStatus::Active.is_deliverable());
        assert!(!EndpointStatus::Inactive.is_deliverable());
        assert!(!EndpointStatus::Pending.is_deliverable());
        assert!(!EndpointStatus::Paused.is_deliverable());
    }

    #[test]
    fn secret_expiry_honors_grace_window() {
        let now = Utc::now();
        let secret = EndpointSecret {
            uid: Uuid::new_v4(),
            value: "sec".into(),
            created_at: now - Duration::days(30),
            expires_at: Some(now - Duration::hours(1)),
        };

        assert!(!secret.is_usable(now, Duration::zero()));
        assert!(secret.is_usable(now, Duration::hours(2)));

        let open_ended = EndpointSecret { expires_at: None, ..secret };
        assert!(open_ended.is_usable(now, Duration::zero()));
    }

    #[test]
    fn id_types_are_distinct_and_ordered() {
        let a = EndpointId(Uuid::from_u128(1));
        let b = EndpointId(Uuid::from_u128(2));
        assert!(a < b);
        assert_eq!(a.to_string().parse::<EndpointId>().unwrap(), a);
    }

    #[test]
    fn default_filter_config_matches_everything() {
        let config = FilterConfig::default();
        assert_eq!(config.event_types, vec!["*".to_string()]);
        assert!(!config.filter.is_flattened);
    }

    #[test]
    fn strategy_kind_parsing_rejects_unknown() {
        assert_eq!("linear".parse::<StrategyKind>().unwrap(), StrategyKind::Linear);
        assert_eq!("exponential".parse::<StrategyKind>().unwrap(), StrategyKind::Exponential);
        assert!("fibonacci".parse::<StrategyKind>().is_err());
    }
}
