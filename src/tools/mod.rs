//! Catalog of retrieval tools the chat model may invoke.
//!
//! Each tool pairs a function-calling schema (shown to the model) with a
//! typed argument struct and a read-only query. The dispatcher validates
//! arguments at the boundary; invalid input becomes a tool result the model
//! can react to, never an error that tears down the stream.

pub mod queries;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use diesel::PgConnection;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::PgPool;
use crate::llm::ToolExecutor;

/// Tool schemas in the function-calling format the inference server expects.
pub fn definitions() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "get_recent_labs",
                "description": "Get recent lab test results for the user. Returns blood work, hormone levels, and other medical test results with values, units, and reference ranges. Use this when the user asks about their lab results, blood tests, or specific medical markers.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "days": {
                            "type": "integer",
                            "description": "Number of days to look back. Default 90."
                        },
                        "test_name": {
                            "type": "string",
                            "description": "Optional: filter by test name (partial match, case-insensitive). Examples: 'HbA1c', 'cholesterol', 'vitamin D', 'TSH'."
                        }
                    },
                    "required": []
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "get_lab_trend",
                "description": "Get the historical trend for a specific lab test over time. Shows how a test value has changed across multiple measurements. Useful for tracking markers like HbA1c, cholesterol, or vitamin D.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "test_name": {
                            "type": "string",
                            "description": "The lab test name to track (partial match). Examples: 'HbA1c', 'LDL', 'Ferritin'."
                        },
                        "months": {
                            "type": "integer",
                            "description": "Number of months to look back. Default 12."
                        }
                    },
                    "required": ["test_name"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "get_symptom_timeline",
                "description": "Get symptom entries logged by the user over a time period. Shows when symptoms occurred, their severity (0-10), duration, triggers, and notes. Use when the user asks about their symptoms, headaches, migraines, pain, mood, or energy.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "symptom_type": {
                            "type": "string",
                            "description": "Optional: filter by symptom type (exact match). Common types: 'migraine', 'headache', 'back_pain', 'mood', 'energy', 'sleep_quality'. Omit to get all types."
                        },
                        "days": {
                            "type": "integer",
                            "description": "Number of days to look back. Default 30."
                        }
                    },
                    "required": []
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "get_wearable_summary",
                "description": "Get wearable device data for a specific health metric. Returns daily aggregated values with statistics. Use for questions about heart rate, steps, sleep, HRV, or weight.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "metric": {
                            "type": "string",
                            "description": "The metric to retrieve. Options: 'heart_rate', 'steps', 'sleep', 'resting_heart_rate', 'heart_rate_variability_sdnn', 'weight', 'active_energy_burned', 'blood_oxygen_saturation', 'distance_walking_running'."
                        },
                        "days": {
                            "type": "integer",
                            "description": "Number of days to look back. Default 30."
                        }
                    },
                    "required": ["metric"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "get_daily_summary",
                "description": "Get a combined summary of ALL health data for a specific date: wearable metrics, lab results drawn that day, and logged symptoms. Use when the user asks about a specific day.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "date": {
                            "type": "string",
                            "description": "Date in YYYY-MM-DD format. Example: '2026-02-20'."
                        }
                    },
                    "required": ["date"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "correlate_metrics",
                "description": "Find correlations between two health metrics over time. Calculates a Pearson correlation coefficient with interpretation. Useful for patterns like 'does poor sleep correlate with more headaches?'. Prefix symptom types with 'symptom:' (e.g. 'symptom:migraine') and lab tests with 'lab:' (e.g. 'lab:HbA1c'); wearable metrics use their code directly (e.g. 'heart_rate').",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "metric_a": {
                            "type": "string",
                            "description": "First metric. Examples: 'heart_rate', 'steps', 'symptom:migraine', 'lab:HbA1c'."
                        },
                        "metric_b": {
                            "type": "string",
                            "description": "Second metric. Same format as metric_a."
                        },
                        "days": {
                            "type": "integer",
                            "description": "Number of days to look back. Default 90."
                        }
                    },
                    "required": ["metric_a", "metric_b"]
                }
            }
        }),
    ]
}

fn default_labs_days() -> i64 {
    90
}

fn default_trend_months() -> i64 {
    12
}

fn default_symptom_days() -> i64 {
    30
}

fn default_correlate_days() -> i64 {
    90
}

#[derive(Debug, Deserialize)]
struct RecentLabsArgs {
    #[serde(default = "default_labs_days")]
    days: i64,
    #[serde(default)]
    test_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LabTrendArgs {
    test_name: String,
    #[serde(default = "default_trend_months")]
    months: i64,
}

#[derive(Debug, Deserialize)]
struct SymptomTimelineArgs {
    #[serde(default)]
    symptom_type: Option<String>,
    #[serde(default = "default_symptom_days")]
    days: i64,
}

#[derive(Debug, Deserialize)]
struct WearableSummaryArgs {
    metric: String,
    #[serde(default = "default_symptom_days")]
    days: i64,
}

#[derive(Debug, Deserialize)]
struct DailySummaryArgs {
    date: String,
}

#[derive(Debug, Deserialize)]
struct CorrelateArgs {
    metric_a: String,
    metric_b: String,
    #[serde(default = "default_correlate_days")]
    days: i64,
}

/// Some models hand back arguments as a JSON-encoded string instead of an
/// object; accept both.
fn normalize_arguments(arguments: &Value) -> Result<Value, String> {
    match arguments {
        Value::String(raw) => {
            serde_json::from_str(raw).map_err(|e| format!("arguments are not valid JSON: {e}"))
        }
        other => Ok(other.clone()),
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: &Value) -> Result<T, String> {
    let normalized = normalize_arguments(arguments)?;
    serde_json::from_value(normalized).map_err(|e| e.to_string())
}

/// Execute one tool call and render its result as a JSON string. Unknown
/// names and invalid arguments are reported inside the result, not raised.
pub fn dispatch(
    conn: &mut PgConnection,
    user_id: Uuid,
    tz: Tz,
    name: &str,
    arguments: &Value,
) -> String {
    let result = match name {
        "get_recent_labs" => parse_args::<RecentLabsArgs>(arguments).map(|args| {
            queries::recent_labs(conn, user_id, args.days, args.test_name.as_deref())
        }),
        "get_lab_trend" => parse_args::<LabTrendArgs>(arguments)
            .map(|args| queries::lab_trend(conn, user_id, &args.test_name, args.months)),
        "get_symptom_timeline" => parse_args::<SymptomTimelineArgs>(arguments).map(|args| {
            queries::symptom_timeline(conn, user_id, args.symptom_type.as_deref(), args.days)
        }),
        "get_wearable_summary" => parse_args::<WearableSummaryArgs>(arguments)
            .map(|args| queries::wearable_summary(conn, user_id, &args.metric, args.days, tz)),
        "get_daily_summary" => parse_args::<DailySummaryArgs>(arguments).and_then(|args| {
            NaiveDate::parse_from_str(&args.date, "%Y-%m-%d")
                .map(|date| queries::daily_summary(conn, user_id, date, tz))
                .map_err(|_| format!("date must be YYYY-MM-DD, got '{}'", args.date))
        }),
        "correlate_metrics" => parse_args::<CorrelateArgs>(arguments).map(|args| {
            queries::correlate(conn, user_id, &args.metric_a, &args.metric_b, args.days, tz)
        }),
        _ => {
            return json!({ "error": "unknown_tool" }).to_string();
        }
    };

    let rendered = match result {
        Ok(Ok(value)) => value,
        Ok(Err(db_error)) => {
            warn!(tool = name, error = %db_error, "tool query failed");
            json!({ "error": format!("tool query failed: {db_error}") })
        }
        Err(detail) => json!({ "error": "invalid_arguments", "detail": detail }),
    };

    rendered.to_string()
}

/// Binds the dispatcher to one user for the duration of a chat stream.
pub struct HealthToolExecutor {
    pool: PgPool,
    user_id: Uuid,
    timezone: Tz,
}

impl HealthToolExecutor {
    pub fn new(pool: PgPool, user_id: Uuid, timezone: Tz) -> Self {
        Self {
            pool,
            user_id,
            timezone,
        }
    }
}

#[async_trait]
impl ToolExecutor for HealthToolExecutor {
    async fn execute(&self, name: &str, arguments: &Value) -> String {
        info!(tool = name, user_id = %self.user_id, "executing health tool");

        let pool = self.pool.clone();
        let user_id = self.user_id;
        let timezone = self.timezone;
        let name = name.to_string();
        let arguments = arguments.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| format!("database pool error: {err}"))?;
            Ok::<String, String>(dispatch(&mut conn, user_id, timezone, &name, &arguments))
        })
        .await;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => json!({ "error": error }).to_string(),
            Err(join_error) => {
                warn!(error = %join_error, "tool execution task panicked");
                json!({ "error": "tool execution failed" }).to_string()
            }
        }
    }
}
