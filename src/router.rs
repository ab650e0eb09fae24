//! Hybrid router: chooses between the fast cloud lane (realtime) and the
//! local/private lane for each request.
//!
//! Classification is table driven. Each table is an ordered list of compiled
//! patterns and the first match wins:
//!
//! 1. privacy screen (sensitive patterns, then private keywords) -> local, no cloud
//! 2. intent rules (tool rules, then talk rules) -> local or realtime
//! 3. latency override for public requests with a tight budget
//!
//! The router never looks at backend health; that is the dispatcher's job.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const PRIVACY_CONFIDENCE: f32 = 0.95;
const TOOL_CONFIDENCE: f32 = 0.90;
const TALK_CONFIDENCE: f32 = 0.85;
const FALLBACK_CONFIDENCE: f32 = 0.75;

/// Context flag set by callers whose user has opted out of cloud processing.
pub const NO_CLOUD_FLAG: &str = "no_cloud";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Fast cloud-hosted conversational model.
    Realtime,
    /// Local model and private tool backends.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    TimeQuery,
    WeatherQuery,
    GeneralQuestion,
    SmallTalk,
    EmailLookup,
    CalendarQuery,
    DocumentRead,
    ContactSearch,
    PrivateRag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Public,
    Private,
    Sensitive,
}

macro_rules! impl_as_str {
    ($ty:ty { $($variant:ident => $name:literal),* $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_as_str!(Route { Realtime => "realtime", Local => "local" });
impl_as_str!(PrivacyLevel { Public => "public", Private => "private", Sensitive => "sensitive" });
impl_as_str!(Intent {
    Greeting => "greeting",
    TimeQuery => "time_query",
    WeatherQuery => "weather_query",
    GeneralQuestion => "general_question",
    SmallTalk => "small_talk",
    EmailLookup => "email_lookup",
    CalendarQuery => "calendar_query",
    DocumentRead => "document_read",
    ContactSearch => "contact_search",
    PrivateRag => "private_rag",
});

/// The router's verdict for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route: Route,
    pub intent: Intent,
    pub confidence: f32,
    pub latency_budget_ms: u32,
    pub privacy_level: PrivacyLevel,
    pub reasoning: String,
    pub no_cloud: bool,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_latency_budget_ms: u32,
    /// Public local-lane requests with a budget below this go realtime instead.
    pub latency_override_threshold_ms: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_latency_budget_ms: 500,
            latency_override_threshold_ms: 300,
        }
    }
}

struct PrivacyRule {
    label: &'static str,
    pattern: Regex,
}

struct IntentRule {
    pattern: Regex,
    intent: Intent,
    route: Route,
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static routing pattern must compile")
}

fn privacy_rules(entries: &[(&'static str, &str)]) -> Vec<PrivacyRule> {
    entries
        .iter()
        .map(|&(label, pattern)| PrivacyRule {
            label,
            pattern: compile(pattern),
        })
        .collect()
}

fn intent_rules(entries: &[(&str, Intent, Route)]) -> Vec<IntentRule> {
    entries
        .iter()
        .map(|&(pattern, intent, route)| IntentRule {
            pattern: compile(pattern),
            intent,
            route,
        })
        .collect()
}

lazy_static! {
    /// PII-shaped tokens and sensitive phrasings. A hit means `Sensitive`.
    static ref SENSITIVE_PATTERNS: Vec<PrivacyRule> = privacy_rules(&[
        ("email_address", r"[\w.%+-]+@[\w-]+(?:\.[\w-]+)*\.\w{2,}"),
        ("phone_number", r"(?:\+|\b0)\d[\d\s-]{6,}\d\b"),
        ("domain", r"\b[\w-]+\.(?:com|se|org|net|io|nu|eu|dev)\b"),
        ("file_path", r"(?:^|\s)(?:~|\.{1,2})?/(?:[\w.-]+/)*[\w.-]+|\b[a-z]:\\"),
        ("email_from", r"\b(?:e-?mail|mail|mejl)\b.*\b(?:from|från)\b"),
        ("calendar_today", r"\b(?:calendar|kalender\w*)\b.*\b(?:today|idag|tomorrow|imorgon)\b"),
    ]);

    /// Private-domain vocabulary. A hit means `Private`.
    static ref PRIVATE_KEYWORDS: Vec<PrivacyRule> = privacy_rules(&[
        ("email", r"\b(?:e-?mail\w*|mail|mejl\w*|inbox|inkorg\w*|e-?post)\b"),
        ("calendar", r"\b(?:calendar|kalender\w*|meeting|meetings|möte|mötet|möten|appointment\w*)\b"),
        ("file", r"\b(?:file|files|fil|filen|filer|document\w*|dokument\w*|folder|mapp\w*)\b"),
        ("contact", r"\b(?:contacts?|kontakt\w*|phone number|telefonnummer|address book|adressbok\w*)\b"),
        ("financial", r"\b(?:bank\w*|account number|kontonummer|salary|lön|invoice\w*|faktur\w*|credit card|kreditkort\w*|password|lösenord\w*|personnummer)\b"),
        ("health", r"\b(?:health|hälsa|doctor|läkare\w*|diagnos\w*|medicine|medicin\w*|prescription|symptom\w*)\b"),
    ]);

    /// Picks the tool intent once the privacy screen has fired.
    static ref PRIVATE_INTENTS: Vec<IntentRule> = intent_rules(&[
        (r"\b(?:e-?mail\w*|mail|mejl\w*|inbox|inkorg\w*|e-?post)\b|@", Intent::EmailLookup, Route::Local),
        (r"\b(?:calendar|kalender\w*|meeting|meetings|möte\w*|appointment\w*|schedule|schema)\b", Intent::CalendarQuery, Route::Local),
        (r"\b(?:file|files|fil|filen|filer|document\w*|dokument\w*|folder|mapp\w*|pdf)\b|(?:^|\s)[~.]?/", Intent::DocumentRead, Route::Local),
        (r"\b(?:contacts?|kontakt\w*|phone|telefon\w*|ring|call)\b|\+?\d[\d\s-]{6,}\d", Intent::ContactSearch, Route::Local),
    ]);

    /// Tool-shaped requests that slipped past the privacy screen, then plain talk.
    static ref INTENT_RULES: Vec<IntentRule> = intent_rules(&[
        (r"\b(?:unread|olästa?|meddelanden|messages)\b", Intent::EmailLookup, Route::Local),
        (r"\b(?:schedule|schema|agenda|påminn\w*|remind\w*|boka|book)\b", Intent::CalendarQuery, Route::Local),
        (r"\b(?:read|läs|open|öppna|summari[sz]e|sammanfatta)\b.*\b(?:notes?|anteckning\w*|reports?|rapport\w*|pdf)\b", Intent::DocumentRead, Route::Local),
        (r"\b(?:call|ring|ringa|sms)\b", Intent::ContactSearch, Route::Local),
        (r"\b(?:remember|kom ihåg|my notes|mina anteckningar|what did i|vad sa jag)\b", Intent::PrivateRag, Route::Local),
        (r"\b(?:hej|hejsan|hallå|tjena|god (?:morgon|dag|kväll)|hello|hi|hey)\b", Intent::Greeting, Route::Realtime),
        (r"\b(?:vad är klockan|hur mycket är klockan|klockan|what time|time is it|vilken dag|what day)\b", Intent::TimeQuery, Route::Realtime),
        (r"\b(?:weather|väder|vädret|regn\w*|rain\w*|temperatur\w*|forecast|prognos\w*)\b", Intent::WeatherQuery, Route::Realtime),
        (r"^(?:vad|vem|var|när|varför|hur|vilken|vilket|what|who|where|when|why|how|which)\b|\?\s*$", Intent::GeneralQuestion, Route::Realtime),
    ]);
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterMetrics {
    pub total_requests: u64,
    pub realtime_routes: u64,
    pub local_routes: u64,
    pub privacy_blocks: u64,
    pub latency_overrides: u64,
    pub realtime_percentage: f64,
    pub local_percentage: f64,
}

#[derive(Default)]
struct RouterCounters {
    total: AtomicU64,
    realtime: AtomicU64,
    local: AtomicU64,
    privacy_blocks: AtomicU64,
    latency_overrides: AtomicU64,
}

pub struct HybridRouter {
    config: RouterConfig,
    counters: RouterCounters,
}

impl HybridRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            counters: RouterCounters::default(),
        }
    }

    /// Route with no context flags and the default latency budget.
    pub fn route(&self, text: &str) -> RouteDecision {
        self.route_request(text, &HashMap::new(), None)
    }

    /// Classify `text` and pick a lane. Never fails; ambiguous input lands on
    /// the local lane with low confidence.
    pub fn route_request(
        &self,
        text: &str,
        context_flags: &HashMap<String, bool>,
        latency_budget_ms: Option<u32>,
    ) -> RouteDecision {
        let budget = latency_budget_ms.unwrap_or(self.config.default_latency_budget_ms);
        let normalized = text.trim().to_lowercase();
        let opted_out = context_flags.get(NO_CLOUD_FLAG).copied().unwrap_or(false);

        let decision = match privacy_screen(&normalized, opted_out) {
            Some((privacy_level, reason)) => {
                self.counters.privacy_blocks.fetch_add(1, Ordering::Relaxed);
                let intent = first_match(&PRIVATE_INTENTS, &normalized)
                    .map(|rule| rule.intent)
                    .unwrap_or(Intent::PrivateRag);
                RouteDecision {
                    route: Route::Local,
                    intent,
                    confidence: PRIVACY_CONFIDENCE,
                    latency_budget_ms: budget.saturating_mul(2),
                    privacy_level,
                    reasoning: format!("{}; kept on the local lane", reason),
                    no_cloud: true,
                }
            }
            None => self.classify_public(&normalized, budget),
        };

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        match decision.route {
            Route::Realtime => self.counters.realtime.fetch_add(1, Ordering::Relaxed),
            Route::Local => self.counters.local.fetch_add(1, Ordering::Relaxed),
        };

        debug!(
            route = %decision.route,
            intent = %decision.intent,
            privacy = %decision.privacy_level,
            confidence = decision.confidence,
            budget_ms = decision.latency_budget_ms,
            "router: {}",
            decision.reasoning
        );
        decision
    }

    fn classify_public(&self, normalized: &str, budget: u32) -> RouteDecision {
        let (route, intent, confidence, mut reasoning) = match first_match(&INTENT_RULES, normalized) {
            Some(rule) => {
                let confidence = match rule.route {
                    Route::Local => TOOL_CONFIDENCE,
                    Route::Realtime => TALK_CONFIDENCE,
                };
                (
                    rule.route,
                    rule.intent,
                    confidence,
                    format!("intent {} matched", rule.intent),
                )
            }
            None => (
                Route::Local,
                Intent::SmallTalk,
                FALLBACK_CONFIDENCE,
                "no intent matched; defaulting to local small talk".to_string(),
            ),
        };

        let route = if route == Route::Local && budget < self.config.latency_override_threshold_ms {
            self.counters.latency_overrides.fetch_add(1, Ordering::Relaxed);
            reasoning.push_str(" (latency override)");
            Route::Realtime
        } else {
            route
        };

        RouteDecision {
            route,
            intent,
            confidence,
            latency_budget_ms: budget,
            privacy_level: PrivacyLevel::Public,
            reasoning,
            no_cloud: false,
        }
    }

    pub fn metrics(&self) -> RouterMetrics {
        let c = &self.counters;
        let total = c.total.load(Ordering::Relaxed);
        let realtime = c.realtime.load(Ordering::Relaxed);
        let local = c.local.load(Ordering::Relaxed);
        let pct = |n: u64| {
            if total == 0 {
                0.0
            } else {
                n as f64 * 100.0 / total as f64
            }
        };
        RouterMetrics {
            total_requests: total,
            realtime_routes: realtime,
            local_routes: local,
            privacy_blocks: c.privacy_blocks.load(Ordering::Relaxed),
            latency_overrides: c.latency_overrides.load(Ordering::Relaxed),
            realtime_percentage: pct(realtime),
            local_percentage: pct(local),
        }
    }
}

impl Default for HybridRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

fn first_match<'a>(rules: &'a [IntentRule], text: &str) -> Option<&'a IntentRule> {
    rules.iter().find(|rule| rule.pattern.is_match(text))
}

/// Returns the privacy level and a short reason when the text must stay local.
fn privacy_screen(normalized: &str, opted_out: bool) -> Option<(PrivacyLevel, String)> {
    if let Some(rule) = SENSITIVE_PATTERNS
        .iter()
        .find(|rule| rule.pattern.is_match(normalized))
    {
        return Some((
            PrivacyLevel::Sensitive,
            format!("sensitive pattern '{}' matched", rule.label),
        ));
    }
    if let Some(rule) = PRIVATE_KEYWORDS
        .iter()
        .find(|rule| rule.pattern.is_match(normalized))
    {
        return Some((
            PrivacyLevel::Private,
            format!("private keyword '{}' matched", rule.label),
        ));
    }
    if opted_out {
        return Some((PrivacyLevel::Private, "caller opted out of cloud".to_string()));
    }
    None
}
