// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable incidents ("pages").
//!
//! A tag identifies the condition an incident is about. Opening an incident
//! for a tag that already has an open one refreshes it instead of creating a
//! second. The notifier is told about new incidents and resolutions; if it is
//! down the incident stays `new` and can be re-triggered later.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{FleetError, FleetResult};
use crate::fleet::Fleet;
use crate::model::{PageRecord, PageStatus, Severity};
use crate::store;

/// Build a tag from its parts.
pub fn tag(parts: &[&str]) -> String {
    parts.join(":")
}

/// Parameters of an incident.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub tag: String,
    pub summary: String,
    pub severity: Severity,
    pub details: Value,
    pub query_id: Option<String>,
    pub db_name: Option<String>,
    pub node_id: Option<String>,
}

impl NewIncident {
    pub fn new(tag: impl Into<String>, summary: impl Into<String>, severity: Severity) -> Self {
        Self {
            tag: tag.into(),
            summary: summary.into(),
            severity,
            details: Value::Object(Default::default()),
            query_id: None,
            db_name: None,
            node_id: None,
        }
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn query(mut self, query_id: &str, db_name: &str) -> Self {
        self.query_id = Some(query_id.to_string());
        self.db_name = Some(db_name.to_string());
        self
    }
}

/// Open an incident, or refresh the open one with the same tag.
pub async fn open(
    fleet: &Fleet,
    incident: NewIncident,
    now: DateTime<Utc>,
) -> FleetResult<PageRecord> {
    let details = incident.details.to_string();

    if let Some(existing) = store::pages::open_by_tag(&fleet.pool, &incident.tag).await? {
        store::pages::refresh(&fleet.pool, &existing.id, &incident.summary, &details).await?;
        return get(fleet, &existing.id).await;
    }

    let page = PageRecord {
        id: Uuid::new_v4().to_string(),
        tag: incident.tag.clone(),
        summary: incident.summary.clone(),
        severity: incident.severity.as_ref().to_string(),
        status: PageStatus::New.as_ref().to_string(),
        details,
        query_id: incident.query_id.clone(),
        db_name: incident.db_name.clone(),
        node_id: incident.node_id.clone(),
        created_at: now,
        resolved_at: None,
    };

    if let Err(e) = store::pages::insert(&fleet.pool, &page).await {
        // Lost a race with another opener of the same tag.
        if let Some(existing) = store::pages::open_by_tag(&fleet.pool, &incident.tag).await? {
            return Ok(existing);
        }
        return Err(e.into());
    }

    info!(tag = %page.tag, severity = %page.severity, "Incident opened");
    trigger(fleet, &page).await?;
    get(fleet, &page.id).await
}

/// Resolve the open incident for `tag`. Returns whether one was open.
pub async fn resolve(fleet: &Fleet, tag: &str, now: DateTime<Utc>) -> FleetResult<bool> {
    let Some(page) = store::pages::open_by_tag(&fleet.pool, tag).await? else {
        return Ok(false);
    };
    resolve_page(fleet, &page, now).await?;
    Ok(true)
}

/// Resolve an incident by id.
pub async fn resolve_by_id(
    fleet: &Fleet,
    page_id: &str,
    now: DateTime<Utc>,
) -> FleetResult<PageRecord> {
    let page = get(fleet, page_id).await?;
    if page.is_open() {
        resolve_page(fleet, &page, now).await?;
    }
    get(fleet, page_id).await
}

async fn resolve_page(fleet: &Fleet, page: &PageRecord, now: DateTime<Utc>) -> FleetResult<()> {
    if page.page_status() != PageStatus::New
        && let Err(e) = fleet.collab.notifier.resolve(&page.tag).await
    {
        warn!(tag = %page.tag, error = %e, "Notifier rejected resolution");
    }
    let resolved = PageStatus::Resolved.as_ref();
    store::pages::set_status(&fleet.pool, &page.id, resolved, Some(now)).await?;
    info!(tag = %page.tag, "Incident resolved");
    Ok(())
}

/// Mark an open incident as seen.
pub async fn acknowledge(fleet: &Fleet, page_id: &str) -> FleetResult<PageRecord> {
    let page = get(fleet, page_id).await?;
    if !page.is_open() {
        return Err(FleetError::InvalidState(format!(
            "incident {page_id} is resolved"
        )));
    }
    store::pages::set_status(&fleet.pool, page_id, PageStatus::Acknowledged.as_ref(), None).await?;
    get(fleet, page_id).await
}

/// Deliver an open incident to the notifier again.
pub async fn retrigger(fleet: &Fleet, page_id: &str) -> FleetResult<PageRecord> {
    let page = get(fleet, page_id).await?;
    if !page.is_open() {
        return Err(FleetError::InvalidState(format!(
            "incident {page_id} is resolved"
        )));
    }
    trigger(fleet, &page).await?;
    get(fleet, page_id).await
}

/// Open incidents, newest first.
pub async fn list_open(fleet: &Fleet) -> FleetResult<Vec<PageRecord>> {
    Ok(store::pages::list_open(&fleet.pool).await?)
}

/// Every incident ever raised, resolved ones included.
pub async fn history(fleet: &Fleet) -> FleetResult<Vec<PageRecord>> {
    Ok(store::pages::list_all(&fleet.pool).await?)
}

async fn trigger(fleet: &Fleet, page: &PageRecord) -> FleetResult<()> {
    let details = page.details_json();
    match fleet
        .collab
        .notifier
        .trigger(&page.tag, &page.summary, &page.severity, &details)
        .await
    {
        Ok(()) => {
            store::pages::set_status(&fleet.pool, &page.id, PageStatus::Triggered.as_ref(), None)
                .await?;
        }
        Err(e) => {
            warn!(tag = %page.tag, error = %e, "Notifier rejected incident, left as new");
        }
    }
    Ok(())
}

async fn get(fleet: &Fleet, page_id: &str) -> FleetResult<PageRecord> {
    store::pages::get(&fleet.pool, page_id)
        .await?
        .ok_or_else(|| FleetError::not_found("incident", page_id))
}
