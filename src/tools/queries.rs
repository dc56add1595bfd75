//! Read-only analytic queries behind the health tool catalog.
//!
//! Everything here takes a connection and returns a JSON value; nothing in
//! this module writes to the store.

use std::collections::BTreeMap;

use bigdecimal::ToPrimitive;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use diesel::prelude::*;
use diesel::PgConnection;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::{LabResult, SeriesType, SymptomEntry};
use crate::schema::{lab_results, series_types, symptom_entries, wearable_samples};

pub const RECENT_LABS_CAP: i64 = 100;
pub const SYMPTOM_TIMELINE_CAP: i64 = 100;
pub const MIN_CORRELATION_OVERLAP: usize = 5;

/// Metrics that aggregate by daily total rather than daily average.
const SUM_METRICS: &[&str] = &[
    "steps",
    "active_energy_burned",
    "basal_energy_burned",
    "distance_walking_running",
];

const METRIC_ALIASES: &[(&str, &str)] = &[
    ("hr", "heart_rate"),
    ("hrv", "heart_rate_variability_sdnn"),
    ("resting_hr", "resting_heart_rate"),
    ("spo2", "blood_oxygen_saturation"),
    ("energy", "active_energy_burned"),
    ("distance", "distance_walking_running"),
];

fn decimal_to_f64(value: &bigdecimal::BigDecimal) -> Option<f64> {
    value.to_f64()
}

fn optional_decimal(value: &Option<bigdecimal::BigDecimal>) -> Value {
    value
        .as_ref()
        .and_then(decimal_to_f64)
        .map_or(Value::Null, |v| json!(v))
}

pub fn recent_labs(
    conn: &mut PgConnection,
    user_id: Uuid,
    days: i64,
    test_name: Option<&str>,
) -> QueryResult<Value> {
    if days <= 0 {
        return Ok(json!({
            "period_days": days,
            "count": 0,
            "results": [],
        }));
    }

    let cutoff = Utc::now().date_naive() - Duration::days(days);

    let mut query = lab_results::table
        .filter(lab_results::user_id.eq(user_id))
        .filter(lab_results::recorded_at.ge(cutoff))
        .order((lab_results::recorded_at.desc(), lab_results::test_name.asc()))
        .limit(RECENT_LABS_CAP)
        .into_boxed();

    if let Some(name) = test_name {
        query = query.filter(lab_results::test_name.ilike(format!("%{name}%")));
    }

    let rows: Vec<LabResult> = query.load(conn)?;

    let results: Vec<Value> = rows
        .iter()
        .map(|r| {
            let mut record = json!({
                "test_name": r.test_name,
                "value": r.value.to_f64(),
                "unit": r.unit,
                "recorded_at": r.recorded_at.to_string(),
                "status": r.status,
                "reference_min": optional_decimal(&r.reference_min),
                "reference_max": optional_decimal(&r.reference_max),
            });
            if let Some(code) = &r.test_code {
                record["test_code"] = json!(code);
            }
            record
        })
        .collect();

    Ok(json!({
        "period_days": days,
        "count": results.len(),
        "results": results,
    }))
}

pub fn lab_trend(
    conn: &mut PgConnection,
    user_id: Uuid,
    test_name: &str,
    months: i64,
) -> QueryResult<Value> {
    let cutoff = Utc::now().date_naive() - Duration::days(months.max(0) * 30);

    let rows: Vec<LabResult> = lab_results::table
        .filter(lab_results::user_id.eq(user_id))
        .filter(lab_results::test_name.ilike(format!("%{test_name}%")))
        .filter(lab_results::recorded_at.ge(cutoff))
        .order(lab_results::recorded_at.asc())
        .load(conn)?;

    if rows.is_empty() {
        return Ok(json!({
            "test_name": test_name,
            "period_months": months,
            "count": 0,
            "points": [],
            "summary": {
                "latest_value": null,
                "latest_status": null,
                "unit": null,
            },
        }));
    }

    let points: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "recorded_at": r.recorded_at.to_string(),
                "value": r.value.to_f64(),
                "unit": r.unit,
                "status": r.status,
                "reference_min": optional_decimal(&r.reference_min),
                "reference_max": optional_decimal(&r.reference_max),
            })
        })
        .collect();

    let values: Vec<f64> = rows.iter().filter_map(|r| r.value.to_f64()).collect();
    let trend = match (values.first(), values.last()) {
        (Some(first), Some(last)) if values.len() >= 2 && last > first => "increasing",
        (Some(first), Some(last)) if values.len() >= 2 && last < first => "decreasing",
        _ => "stable",
    };
    let latest = rows.last().expect("rows is non-empty");

    Ok(json!({
        "test_name": latest.test_name,
        "period_months": months,
        "count": points.len(),
        "points": points,
        "summary": {
            "latest_value": latest.value.to_f64(),
            "latest_status": latest.status,
            "unit": latest.unit,
            "trend": trend,
        },
    }))
}

pub fn symptom_timeline(
    conn: &mut PgConnection,
    user_id: Uuid,
    symptom_type: Option<&str>,
    days: i64,
) -> QueryResult<Value> {
    let cutoff = Utc::now() - Duration::days(days.max(0));

    let mut query = symptom_entries::table
        .filter(symptom_entries::user_id.eq(user_id))
        .filter(symptom_entries::recorded_at.ge(cutoff))
        .order(symptom_entries::recorded_at.desc())
        .limit(SYMPTOM_TIMELINE_CAP)
        .into_boxed();

    if let Some(symptom) = symptom_type {
        query = query.filter(symptom_entries::symptom_type.eq(symptom));
    }

    let rows: Vec<SymptomEntry> = query.load(conn)?;

    let entries: Vec<Value> = rows
        .iter()
        .map(|s| {
            let mut entry = json!({
                "symptom_type": s.symptom_type,
                "severity": s.severity,
                "recorded_at": s.recorded_at.to_rfc3339(),
            });
            if let Some(notes) = &s.notes {
                entry["notes"] = json!(notes);
            }
            if let Some(triggers) = &s.triggers {
                entry["triggers"] = triggers.clone();
            }
            if let Some(duration) = s.duration_minutes {
                entry["duration_minutes"] = json!(duration);
            }
            entry
        })
        .collect();

    let mut by_type: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
    for s in &rows {
        by_type.entry(&s.symptom_type).or_default().push(s.severity);
    }

    let frequency: BTreeMap<&str, Value> = by_type
        .into_iter()
        .map(|(symptom, severities)| {
            let count = severities.len();
            let avg = severities.iter().sum::<i32>() as f64 / count as f64;
            let max = severities.iter().copied().max().unwrap_or(0);
            (
                symptom,
                json!({
                    "count": count,
                    "avg_severity": (avg * 10.0).round() / 10.0,
                    "max_severity": max,
                }),
            )
        })
        .collect();

    Ok(json!({
        "period_days": days,
        "count": entries.len(),
        "entries": entries,
        "frequency": frequency,
    }))
}

pub fn wearable_summary(
    conn: &mut PgConnection,
    user_id: Uuid,
    metric: &str,
    days: i64,
    tz: Tz,
) -> QueryResult<Value> {
    let Some(series_type) = resolve_series_type(conn, metric)? else {
        let available: Vec<String> = series_types::table
            .select(series_types::code)
            .order(series_types::code.asc())
            .load(conn)?;
        return Ok(json!({
            "metric": metric,
            "error": format!("unknown metric '{metric}'"),
            "available_metrics": available,
        }));
    };

    let cutoff = Utc::now() - Duration::days(days.max(0));
    let samples: Vec<(DateTime<Utc>, f64)> = wearable_samples::table
        .filter(wearable_samples::user_id.eq(user_id))
        .filter(wearable_samples::series_type_id.eq(series_type.id))
        .filter(wearable_samples::recorded_at.ge(cutoff))
        .select((wearable_samples::recorded_at, wearable_samples::value))
        .order(wearable_samples::recorded_at.asc())
        .load(conn)?;

    let use_sum = SUM_METRICS.contains(&series_type.code.as_str());
    let mut buckets: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for (recorded_at, value) in &samples {
        let day = recorded_at.with_timezone(&tz).date_naive();
        buckets.entry(day).or_default().push(*value);
    }

    let mut daily = Vec::with_capacity(buckets.len());
    let mut daily_values = Vec::with_capacity(buckets.len());
    for (day, values) in &buckets {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let sum: f64 = values.iter().sum();
        let avg = sum / values.len() as f64;
        let daily_value = if use_sum { sum } else { avg };
        daily_values.push(daily_value);

        let mut bucket = json!({
            "date": day.to_string(),
            "min": min,
            "max": max,
            "samples": values.len(),
        });
        if use_sum {
            bucket["total"] = json!(round1(sum));
        } else {
            bucket["avg"] = json!(round1(avg));
        }
        daily.push(bucket);
    }

    let statistics = if daily_values.is_empty() {
        json!({ "sample_count": 0 })
    } else {
        let min = daily_values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = daily_values
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let mean = daily_values.iter().sum::<f64>() / daily_values.len() as f64;
        json!({
            "min": round1(min),
            "max": round1(max),
            "mean": round1(mean),
            "sample_count": samples.len(),
            "days_with_data": daily_values.len(),
        })
    };

    Ok(json!({
        "metric": series_type.code,
        "unit": series_type.unit,
        "period_days": days,
        "statistics": statistics,
        "daily": daily,
    }))
}

pub fn daily_summary(
    conn: &mut PgConnection,
    user_id: Uuid,
    date: NaiveDate,
    tz: Tz,
) -> QueryResult<Value> {
    let midnight = date.and_hms_opt(0, 0, 0).expect("midnight is valid");
    let day_start = tz
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight));
    let day_end = day_start + Duration::days(1);

    let mut summary = json!({ "date": date.to_string() });

    let labs: Vec<LabResult> = lab_results::table
        .filter(lab_results::user_id.eq(user_id))
        .filter(lab_results::recorded_at.eq(date))
        .order(lab_results::test_name.asc())
        .load(conn)?;
    if !labs.is_empty() {
        summary["lab_results"] = Value::Array(
            labs.iter()
                .map(|r| {
                    json!({
                        "test_name": r.test_name,
                        "value": r.value.to_f64(),
                        "unit": r.unit,
                        "status": r.status,
                    })
                })
                .collect(),
        );
    }

    let symptoms: Vec<SymptomEntry> = symptom_entries::table
        .filter(symptom_entries::user_id.eq(user_id))
        .filter(symptom_entries::recorded_at.ge(day_start))
        .filter(symptom_entries::recorded_at.lt(day_end))
        .order(symptom_entries::recorded_at.asc())
        .load(conn)?;
    if !symptoms.is_empty() {
        summary["symptoms"] = Value::Array(
            symptoms
                .iter()
                .map(|s| {
                    json!({
                        "symptom_type": s.symptom_type,
                        "severity": s.severity,
                        "notes": s.notes,
                    })
                })
                .collect(),
        );
    }

    let key_metrics = ["heart_rate", "steps", "active_energy_burned", "sleep"];
    let types: Vec<SeriesType> = series_types::table
        .filter(series_types::code.eq_any(key_metrics))
        .load(conn)?;

    let mut metrics = serde_json::Map::new();
    for series_type in types {
        let values: Vec<f64> = wearable_samples::table
            .filter(wearable_samples::user_id.eq(user_id))
            .filter(wearable_samples::series_type_id.eq(series_type.id))
            .filter(wearable_samples::recorded_at.ge(day_start))
            .filter(wearable_samples::recorded_at.lt(day_end))
            .select(wearable_samples::value)
            .load(conn)?;

        if values.is_empty() {
            continue;
        }

        let sum: f64 = values.iter().sum();
        let entry = if SUM_METRICS.contains(&series_type.code.as_str()) {
            json!({
                "unit": series_type.unit,
                "total": round1(sum),
                "samples": values.len(),
            })
        } else {
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            json!({
                "unit": series_type.unit,
                "avg": round1(sum / values.len() as f64),
                "min": min,
                "max": max,
                "samples": values.len(),
            })
        };
        metrics.insert(series_type.code, entry);
    }
    if !metrics.is_empty() {
        summary["wearable_metrics"] = Value::Object(metrics);
    }

    Ok(summary)
}

pub fn correlate(
    conn: &mut PgConnection,
    user_id: Uuid,
    metric_a: &str,
    metric_b: &str,
    days: i64,
    tz: Tz,
) -> QueryResult<Value> {
    let values_a = metric_daily_values(conn, user_id, metric_a, days, tz)?;
    let values_b = metric_daily_values(conn, user_id, metric_b, days, tz)?;

    let overlap: Vec<NaiveDate> = values_a
        .keys()
        .filter(|day| values_b.contains_key(*day))
        .copied()
        .collect();

    if overlap.len() < MIN_CORRELATION_OVERLAP {
        return Ok(json!({
            "metric_a": metric_a,
            "metric_b": metric_b,
            "period_days": days,
            "overlapping_days": overlap.len(),
            "insufficient_data": true,
        }));
    }

    let a_vals: Vec<f64> = overlap.iter().map(|d| values_a[d]).collect();
    let b_vals: Vec<f64> = overlap.iter().map(|d| values_b[d]).collect();

    let mut result = json!({
        "metric_a": metric_a,
        "metric_b": metric_b,
        "period_days": days,
        "overlapping_days": overlap.len(),
        "sample_size": overlap.len(),
    });

    match pearson(&a_vals, &b_vals) {
        Some(coefficient) => {
            result["correlation"] = json!(coefficient);
            result["interpretation"] = json!(interpret_correlation(coefficient));
        }
        None => {
            result["interpretation"] = json!("insufficient variance");
        }
    }

    Ok(result)
}

fn metric_daily_values(
    conn: &mut PgConnection,
    user_id: Uuid,
    metric: &str,
    days: i64,
    tz: Tz,
) -> QueryResult<BTreeMap<NaiveDate, f64>> {
    let cutoff = Utc::now() - Duration::days(days.max(0));
    let cutoff_date = Utc::now().date_naive() - Duration::days(days.max(0));

    if let Some(symptom_type) = metric.strip_prefix("symptom:") {
        let rows: Vec<(DateTime<Utc>, i32)> = symptom_entries::table
            .filter(symptom_entries::user_id.eq(user_id))
            .filter(symptom_entries::symptom_type.eq(symptom_type))
            .filter(symptom_entries::recorded_at.ge(cutoff))
            .select((symptom_entries::recorded_at, symptom_entries::severity))
            .load(conn)?;

        let mut buckets: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
        for (recorded_at, severity) in rows {
            let day = recorded_at.with_timezone(&tz).date_naive();
            buckets.entry(day).or_default().push(severity as f64);
        }
        return Ok(buckets
            .into_iter()
            .map(|(day, vals)| (day, vals.iter().sum::<f64>() / vals.len() as f64))
            .collect());
    }

    if let Some(test_name) = metric.strip_prefix("lab:") {
        let rows: Vec<LabResult> = lab_results::table
            .filter(lab_results::user_id.eq(user_id))
            .filter(lab_results::test_name.ilike(format!("%{test_name}%")))
            .filter(lab_results::recorded_at.ge(cutoff_date))
            .load(conn)?;
        return Ok(rows
            .iter()
            .filter_map(|r| r.value.to_f64().map(|v| (r.recorded_at, v)))
            .collect());
    }

    let Some(series_type) = resolve_series_type(conn, metric)? else {
        return Ok(BTreeMap::new());
    };

    let rows: Vec<(DateTime<Utc>, f64)> = wearable_samples::table
        .filter(wearable_samples::user_id.eq(user_id))
        .filter(wearable_samples::series_type_id.eq(series_type.id))
        .filter(wearable_samples::recorded_at.ge(cutoff))
        .select((wearable_samples::recorded_at, wearable_samples::value))
        .load(conn)?;

    let use_sum = SUM_METRICS.contains(&series_type.code.as_str());
    let mut buckets: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for (recorded_at, value) in rows {
        let day = recorded_at.with_timezone(&tz).date_naive();
        buckets.entry(day).or_default().push(value);
    }
    Ok(buckets
        .into_iter()
        .map(|(day, vals)| {
            let sum: f64 = vals.iter().sum();
            let value = if use_sum { sum } else { sum / vals.len() as f64 };
            (day, value)
        })
        .collect())
}

fn resolve_series_type(conn: &mut PgConnection, metric: &str) -> QueryResult<Option<SeriesType>> {
    let direct: Option<SeriesType> = series_types::table
        .filter(series_types::code.eq(metric))
        .first(conn)
        .optional()?;
    if direct.is_some() {
        return Ok(direct);
    }

    let Some((_, canonical)) = METRIC_ALIASES.iter().find(|(alias, _)| *alias == metric) else {
        return Ok(None);
    };
    series_types::table
        .filter(series_types::code.eq(canonical))
        .first(conn)
        .optional()
}

/// Pearson correlation coefficient, rounded to three decimals. `None` when
/// either side has no variance.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n == 0 {
        return None;
    }

    let n_f = n as f64;
    let mean_a = a[..n].iter().sum::<f64>() / n_f;
    let mean_b = b[..n].iter().sum::<f64>() / n_f;

    let cov = (0..n)
        .map(|i| (a[i] - mean_a) * (b[i] - mean_b))
        .sum::<f64>()
        / n_f;
    let std_a = ((0..n).map(|i| (a[i] - mean_a).powi(2)).sum::<f64>() / n_f).sqrt();
    let std_b = ((0..n).map(|i| (b[i] - mean_b).powi(2)).sum::<f64>() / n_f).sqrt();

    if std_a == 0.0 || std_b == 0.0 {
        return None;
    }

    Some((cov / (std_a * std_b) * 1000.0).round() / 1000.0)
}

pub fn interpret_correlation(coefficient: f64) -> &'static str {
    let magnitude = coefficient.abs();
    if magnitude >= 0.7 {
        if coefficient > 0.0 {
            "strong positive"
        } else {
            "strong negative"
        }
    } else if magnitude >= 0.4 {
        if coefficient > 0.0 {
            "moderate positive"
        } else {
            "moderate negative"
        }
    } else if magnitude >= 0.2 {
        if coefficient > 0.0 {
            "weak positive"
        } else {
            "weak negative"
        }
    } else {
        "no significant correlation"
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
