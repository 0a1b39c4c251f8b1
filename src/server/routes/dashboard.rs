//! Usage chart routes
//!
//! `/api/dashboard` serves gap-filled chart series plus the live RPM/TPM
//! counters; `/api/dashboardv2` serves the raw buckets.

use actix_web::{HttpResponse, Result as ActixResult, web};
use chrono::FixedOffset;
use serde::Deserialize;

use crate::core::dashboard::{self, DashboardResponse, TimeSpan};
use crate::core::limiter::CHANNEL_STAR;
use crate::server::{AppState, response};
use crate::storage::store::DashboardQuery;

#[derive(Debug, Deserialize)]
pub struct DashboardParams {
    #[serde(rename = "type", default)]
    pub range_type: String,
    #[serde(default)]
    pub timespan: String,
    pub start_timestamp: Option<i64>,
    pub end_timestamp: Option<i64>,
    #[serde(default)]
    pub timezone: String,
    pub channel: Option<i32>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub token_name: String,
}

/// Accepts `+08:00` / `-05:30` style offsets; anything else is UTC.
fn parse_timezone(s: &str) -> FixedOffset {
    let utc = FixedOffset::east_opt(0).expect("zero offset");
    let (sign, rest) = match s.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return utc,
    };
    let mut pieces = rest.splitn(2, ':');
    let hours: i32 = pieces.next().and_then(|h| h.parse().ok()).unwrap_or(0);
    let minutes: i32 = pieces.next().and_then(|m| m.parse().ok()).unwrap_or(0);
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).unwrap_or(utc)
}

fn build_query(params: &DashboardParams, group: Option<String>) -> (DashboardQuery, TimeSpan) {
    let tz = parse_timezone(&params.timezone);
    let (start, end, span) = dashboard::resolve_time_range(
        &params.range_type,
        &params.timespan,
        params.start_timestamp,
        params.end_timestamp,
        tz,
    );
    (
        DashboardQuery {
            start,
            end,
            span,
            tz,
            channel: params.channel.filter(|c| *c != 0),
            model: Some(params.model.clone()).filter(|m| !m.is_empty()),
            group,
            token_name: Some(params.token_name.clone()).filter(|t| !t.is_empty()),
        },
        span,
    )
}

pub async fn get_dashboard(
    state: web::Data<AppState>,
    params: web::Query<DashboardParams>,
) -> ActixResult<HttpResponse> {
    let (query, span) = build_query(&params, None);
    let data = match state.store.dashboard_data(&query).await {
        Ok(data) => data,
        Err(e) => return Ok(response::from_gateway_error(&e)),
    };

    let channel_key = match query.channel {
        Some(id) => id.to_string(),
        None => CHANNEL_STAR.to_string(),
    };
    let chart_data = dashboard::fill_gaps(data.chart_data, query.start, query.end, span);

    Ok(response::success(DashboardResponse {
        chart_data,
        total_count: data.total_count,
        exception_count: data.exception_count,
        used_amount: data.used_amount,
        rpm: state.relay.limiter.channel_rpm(&channel_key, &params.model),
        tpm: state.relay.limiter.channel_tpm(&channel_key, &params.model),
    }))
}

pub async fn get_group_dashboard(
    state: web::Data<AppState>,
    group: web::Path<String>,
    params: web::Query<DashboardParams>,
) -> ActixResult<HttpResponse> {
    let group = group.into_inner();
    if group.is_empty() {
        return Ok(response::api_error(
            actix_web::http::StatusCode::BAD_REQUEST,
            "invalid group parameter",
        ));
    }

    let (query, span) = build_query(&params, Some(group.clone()));
    let data = match state.store.dashboard_data(&query).await {
        Ok(data) => data,
        Err(e) => return Ok(response::from_gateway_error(&e)),
    };

    let chart_data = dashboard::fill_gaps(data.chart_data, query.start, query.end, span);

    Ok(response::success(DashboardResponse {
        chart_data,
        total_count: data.total_count,
        exception_count: data.exception_count,
        used_amount: data.used_amount,
        rpm: state
            .relay
            .limiter
            .group_rpm(&group, &params.model, &params.token_name),
        tpm: state
            .relay
            .limiter
            .group_tpm(&group, &params.model, &params.token_name),
    }))
}

/// Raw buckets, no gap filling.
pub async fn get_time_series(
    state: web::Data<AppState>,
    params: web::Query<DashboardParams>,
) -> ActixResult<HttpResponse> {
    let (query, _) = build_query(&params, None);
    match state.store.dashboard_data(&query).await {
        Ok(data) => Ok(response::success(data.chart_data)),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}

pub async fn get_group_time_series(
    state: web::Data<AppState>,
    group: web::Path<String>,
    params: web::Query<DashboardParams>,
) -> ActixResult<HttpResponse> {
    let (query, _) = build_query(&params, Some(group.into_inner()));
    match state.store.dashboard_data(&query).await {
        Ok(data) => Ok(response::success(data.chart_data)),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timezone_parsing() {
        assert_eq!(parse_timezone("+08:00").local_minus_utc(), 8 * 3600);
        assert_eq!(parse_timezone("-05:30").local_minus_utc(), -(5 * 3600 + 1800));
        assert_eq!(parse_timezone("Local").local_minus_utc(), 0);
        assert_eq!(parse_timezone("").local_minus_utc(), 0);
    }
}
