use std::sync::{Arc, Mutex, MutexGuard};

use cadence_core::types::{ItemId, OwnerId, Platform};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::{init_db, parse_ts, ts},
    error::{Result, SchedulerError},
    retry::RetryPolicy,
    transition::{plan, RunResult, Transition},
    types::{
        ClaimedItem, ItemFilter, ItemKind, ItemStats, ItemStatus, ItemUpdate, NewItem,
        PlatformResult, PublishAttempt, ScheduleItem,
    },
};

/// Column order understood by [`row_to_item`].
const ITEM_COLUMNS: &str = "id, owner_id, content, media_refs, platforms, kind, status,
     next_run_at, occurrence_at, recurrence, occurrence_count, attempt_count,
     max_attempts, last_error, claimed_at, created_at, updated_at, completed_at";

/// What happened when a worker's result was written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The transition was stored and the claim released.
    Updated(Transition),
    /// The claim was no longer held: the item was cancelled or deleted while
    /// in flight, or its lease expired. The worker's outcome was discarded.
    Suppressed,
}

/// Persistent store for schedule items and their publish attempt log.
///
/// Wraps one SQLite connection in a `Mutex`. Each scanner/engine instance
/// should own its own store (its own connection); the claim protocol relies on
/// SQLite serialising writers, not on this mutex.
#[derive(Clone)]
pub struct ItemStore {
    conn: Arc<Mutex<Connection>>,
}

impl ItemStore {
    /// Wrap a connection, applying the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::LockPoisoned)
    }

    // --- owner operations --------------------------------------------------

    /// Validate and persist a new item in `Pending`.
    #[instrument(skip(self, req), fields(owner_id = %req.owner_id))]
    pub fn create(&self, req: NewItem, max_attempts: u32, now: DateTime<Utc>) -> Result<ScheduleItem> {
        let req = req.validate(now)?;
        let kind = if req.recurrence.is_some() {
            ItemKind::Recurring
        } else {
            ItemKind::OneShot
        };
        let item = ScheduleItem {
            id: ItemId::new(),
            owner_id: req.owner_id,
            content: req.content,
            media_refs: req.media_refs,
            platforms: req.platforms,
            kind,
            status: ItemStatus::Pending,
            next_run_at: Some(req.schedule_time),
            occurrence_at: Some(req.schedule_time),
            recurrence: req.recurrence,
            occurrence_count: 0,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let media_json = serde_json::to_string(&item.media_refs)?;
        let platforms_json = serde_json::to_string(&item.platforms)?;
        let recurrence_json = item
            .recurrence
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let run_at = item.next_run_at.map(ts);

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO schedule_items
             (id, owner_id, content, media_refs, platforms, kind, status,
              next_run_at, occurrence_at, recurrence, occurrence_count, attempt_count,
              max_attempts, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,'pending',?7,?7,?8,0,0,?9,?10,?10)",
            params![
                item.id.as_str(),
                item.owner_id.as_str(),
                item.content,
                media_json,
                platforms_json,
                item.kind.to_string(),
                run_at,
                recurrence_json,
                item.max_attempts,
                ts(now),
            ],
        )?;

        info!(item_id = %item.id, kind = %item.kind, platforms = item.platforms.len(), "item created");
        Ok(item)
    }

    pub fn get(&self, id: &ItemId) -> Result<ScheduleItem> {
        let conn = self.lock()?;
        fetch(&conn, id)?.ok_or_else(|| not_found(id))
    }

    /// Items matching `filter`, newest first.
    pub fn list(&self, filter: &ItemFilter) -> Result<Vec<ScheduleItem>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM schedule_items
             WHERE (?1 IS NULL OR owner_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(
                params![
                    filter.owner_id.as_ref().map(OwnerId::as_str),
                    filter.status.map(ItemStatus::as_str),
                ],
                row_to_item,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Edit a pending item. Any other status is rejected.
    #[instrument(skip(self, update))]
    pub fn update(&self, id: &ItemId, update: ItemUpdate, now: DateTime<Utc>) -> Result<ScheduleItem> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut item = fetch(&tx, id)?.ok_or_else(|| not_found(id))?;
        if item.status != ItemStatus::Pending {
            return Err(SchedulerError::InvalidTransition {
                action: "update",
                status: item.status,
            });
        }
        update.apply_to(&mut item, now)?;
        item.updated_at = now;

        tx.execute(
            "UPDATE schedule_items
             SET content = ?2, media_refs = ?3, platforms = ?4, kind = ?5,
                 next_run_at = ?6, occurrence_at = ?7, recurrence = ?8, updated_at = ?9
             WHERE id = ?1 AND status = 'pending'",
            params![
                id.as_str(),
                item.content,
                serde_json::to_string(&item.media_refs)?,
                serde_json::to_string(&item.platforms)?,
                item.kind.to_string(),
                item.next_run_at.map(ts),
                item.occurrence_at.map(ts),
                item.recurrence.as_ref().map(serde_json::to_string).transpose()?,
                ts(now),
            ],
        )?;
        tx.commit()?;

        info!(item_id = %id, "item updated");
        Ok(item)
    }

    /// Remove an item and its attempt log. In-flight items must be cancelled first.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &ItemId) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM schedule_items WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let status = status.ok_or_else(|| not_found(id))?;
        if status == ItemStatus::InFlight.as_str() {
            return Err(SchedulerError::InvalidTransition {
                action: "delete",
                status: ItemStatus::InFlight,
            });
        }

        tx.execute("DELETE FROM publish_attempts WHERE item_id = ?1", [id.as_str()])?;
        tx.execute("DELETE FROM schedule_items WHERE id = ?1", [id.as_str()])?;
        tx.commit()?;

        info!(item_id = %id, "item deleted");
        Ok(())
    }

    /// Pending/Paused → Active. Recurring items only.
    pub fn activate(&self, id: &ItemId, now: DateTime<Utc>) -> Result<ScheduleItem> {
        self.owner_transition(
            id,
            "activate",
            |item| {
                if !item.is_recurring() {
                    return Err(SchedulerError::Validation(
                        "only recurring items can be activated".into(),
                    ));
                }
                matches!(item.status, ItemStatus::Pending | ItemStatus::Paused)
                    .then_some(())
                    .ok_or(SchedulerError::InvalidTransition {
                        action: "activate",
                        status: item.status,
                    })
            },
            "status = 'active'",
            now,
        )
    }

    /// Active → Paused. `next_run_at` is left as it was.
    pub fn pause(&self, id: &ItemId, now: DateTime<Utc>) -> Result<ScheduleItem> {
        self.owner_transition(
            id,
            "pause",
            |item| {
                (item.status == ItemStatus::Active)
                    .then_some(())
                    .ok_or(SchedulerError::InvalidTransition {
                        action: "pause",
                        status: item.status,
                    })
            },
            "status = 'paused'",
            now,
        )
    }

    /// Any non-terminal status → Cancelled.
    ///
    /// An in-flight item keeps its claim token: the worker finishes, finds the
    /// item cancelled and only clears the claim.
    pub fn cancel(&self, id: &ItemId, now: DateTime<Utc>) -> Result<ScheduleItem> {
        self.owner_transition(
            id,
            "cancel",
            |item| {
                (!item.status.is_terminal())
                    .then_some(())
                    .ok_or(SchedulerError::InvalidTransition {
                        action: "cancel",
                        status: item.status,
                    })
            },
            "status = 'cancelled', next_run_at = NULL",
            now,
        )
    }

    /// Failed → Pending with a fresh attempt budget, due immediately.
    pub fn retry(&self, id: &ItemId, now: DateTime<Utc>) -> Result<ScheduleItem> {
        self.owner_transition(
            id,
            "retry",
            |item| {
                (item.status == ItemStatus::Failed)
                    .then_some(())
                    .ok_or(SchedulerError::InvalidTransition {
                        action: "retry",
                        status: item.status,
                    })
            },
            "status = 'pending', attempt_count = 0, next_run_at = ?2",
            now,
        )
    }

    /// Check `allowed` against the current row, then apply `set` only if the
    /// status has not moved underneath us. `set` may use `?2` for `now`.
    fn owner_transition(
        &self,
        id: &ItemId,
        action: &'static str,
        allowed: impl Fn(&ScheduleItem) -> Result<()>,
        set: &str,
        now: DateTime<Utc>,
    ) -> Result<ScheduleItem> {
        let conn = self.lock()?;
        let item = fetch(&conn, id)?.ok_or_else(|| not_found(id))?;
        allowed(&item)?;

        let sql = format!(
            "UPDATE schedule_items SET {set}, updated_at = ?2
             WHERE id = ?1 AND status = ?3"
        );
        let n = conn.execute(&sql, params![id.as_str(), ts(now), item.status.as_str()])?;
        let updated = fetch(&conn, id)?.ok_or_else(|| not_found(id))?;
        if n == 0 {
            // lost a race with a scanner or worker
            return Err(SchedulerError::InvalidTransition {
                action,
                status: updated.status,
            });
        }

        info!(item_id = %id, action, from = %item.status, to = %updated.status, "owner transition");
        Ok(updated)
    }

    // --- scanner / dispatcher ----------------------------------------------

    /// Items a scan at `now` would try to claim, earliest first.
    pub fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduleItem>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM schedule_items
             WHERE status IN ('pending', 'active')
               AND claim_token IS NULL
               AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![ts(now), limit], row_to_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Try to claim one item for dispatch.
    ///
    /// The claim is a single conditional UPDATE: of any number of concurrent
    /// callers (across connections and processes) at most one sees a changed
    /// row. `force` skips the `next_run_at` check (send-now).
    pub fn claim(&self, id: &ItemId, now: DateTime<Utc>, force: bool) -> Result<Option<ClaimedItem>> {
        let token = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE schedule_items
             SET pre_claim_status = status, status = 'in_flight',
                 claim_token = ?2, claimed_at = ?3, updated_at = ?3
             WHERE id = ?1
               AND claim_token IS NULL
               AND status IN ('pending', 'active')
               AND (?4 OR (next_run_at IS NOT NULL AND next_run_at <= ?3))",
            params![id.as_str(), token, ts(now), force],
        )?;
        if n == 0 {
            debug!(item_id = %id, "claim lost or item no longer due; skipping");
            return Ok(None);
        }

        let item = fetch(&conn, id)?.ok_or_else(|| not_found(id))?;
        let pre: String = conn.query_row(
            "SELECT pre_claim_status FROM schedule_items WHERE id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )?;
        let pre_claim_status = pre.parse().unwrap_or(ItemStatus::Pending);

        debug!(item_id = %id, force, "item claimed");
        Ok(Some(ClaimedItem {
            item,
            claim_token: token,
            pre_claim_status,
        }))
    }

    /// Claim every due item (up to `limit`) this caller can win.
    pub fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ClaimedItem>> {
        let ids: Vec<ItemId> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM schedule_items
                 WHERE status IN ('pending', 'active')
                   AND claim_token IS NULL
                   AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![ts(now), limit], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(ItemId::from).collect()
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(c) = self.claim(&id, now, false)? {
                claimed.push(c);
            }
        }
        Ok(claimed)
    }

    /// Force-claim an item regardless of its `next_run_at`.
    pub fn claim_now(&self, id: &ItemId, now: DateTime<Utc>) -> Result<ClaimedItem> {
        match self.claim(id, now, true)? {
            Some(claimed) => Ok(claimed),
            None => {
                let item = self.get(id)?;
                Err(SchedulerError::InvalidTransition {
                    action: "send",
                    status: item.status,
                })
            }
        }
    }

    /// Undo a claim that never reached a worker: restore the pre-claim status.
    pub fn release(&self, claim: &ClaimedItem, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE schedule_items
             SET status = COALESCE(pre_claim_status, 'pending'), pre_claim_status = NULL,
                 claim_token = NULL, claimed_at = NULL, updated_at = ?3
             WHERE id = ?1 AND claim_token = ?2 AND status = 'in_flight'",
            params![claim.item.id.as_str(), claim.claim_token, ts(now)],
        )?;
        if n == 0 {
            clear_claim(&conn, claim)?;
        }
        debug!(item_id = %claim.item.id, "claim released");
        Ok(())
    }

    /// Recover claims whose holder never reported back.
    ///
    /// An in-flight item claimed at or before `now - lease` is charged one
    /// failed attempt and goes through the retry policy as if its worker had
    /// reported an error. Claim fields left on items cancelled mid-flight are
    /// cleared. Returns how many in-flight items were recovered.
    pub fn reap_expired(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        policy: &RetryPolicy,
        limit: u32,
    ) -> Result<usize> {
        let Some(cutoff) = now.checked_sub_signed(lease) else {
            return Ok(0);
        };
        let cutoff = ts(cutoff);

        let expired: Vec<(String, String, Option<String>)> = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE schedule_items
                 SET claim_token = NULL, claimed_at = NULL, pre_claim_status = NULL
                 WHERE claim_token IS NOT NULL AND status != 'in_flight' AND claimed_at <= ?1",
                [&cutoff],
            )?;
            let mut stmt = conn.prepare_cached(
                "SELECT id, claim_token, pre_claim_status FROM schedule_items
                 WHERE status = 'in_flight'
                   AND claim_token IS NOT NULL
                   AND claimed_at <= ?1
                 ORDER BY claimed_at
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![cutoff, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let error = format!(
            "claim expired after {}s without a result",
            lease.num_seconds()
        );
        let mut reaped = 0;
        for (id, claim_token, pre) in expired {
            let id = ItemId::from(id);
            let item = match self.get(&id) {
                Ok(item) => item,
                Err(e) => {
                    warn!(item_id = %id, "cannot load item with expired claim: {e}");
                    continue;
                }
            };
            let results: Vec<PlatformResult> = item
                .platforms
                .iter()
                .map(|p| PlatformResult::failed(p.clone(), error.clone()))
                .collect();
            let claim = ClaimedItem {
                item,
                claim_token,
                pre_claim_status: pre
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(ItemStatus::Pending),
            };

            if let Applied::Updated(tr) =
                self.apply_outcome(&claim, &RunResult::Failed(error.clone()), policy, now)?
            {
                if let Err(e) = self.record_attempts(
                    &id,
                    claim.item.occurrence_count.saturating_add(1),
                    claim.item.attempt_count.saturating_add(1),
                    &results,
                    now,
                ) {
                    warn!(item_id = %id, "failed to record expired attempt: {e}");
                }
                warn!(item_id = %id, status = %tr.status, "expired claim recovered");
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Refresh the lease on `claim` as a worker picks it up.
    ///
    /// Returns `false` when the claim is no longer held (cancelled, deleted
    /// or reaped while queued); the worker must not publish.
    pub fn renew_claim(&self, claim: &ClaimedItem, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE schedule_items SET claimed_at = ?3
             WHERE id = ?1 AND claim_token = ?2 AND status = 'in_flight'",
            params![claim.item.id.as_str(), claim.claim_token, ts(now)],
        )?;
        if n == 0 {
            clear_claim(&conn, claim)?;
        }
        Ok(n == 1)
    }

    // --- worker ------------------------------------------------------------

    /// Write a worker's result back and release the claim.
    ///
    /// The write is conditional on the claim still being live; a cancelled
    /// (or deleted) item keeps its status and the outcome is dropped.
    pub fn apply_outcome(
        &self,
        claim: &ClaimedItem,
        result: &RunResult,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        let tr = plan(&claim.item, claim.pre_claim_status, result, policy, now);
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE schedule_items
             SET status = ?3, next_run_at = ?4, occurrence_at = ?5,
                 occurrence_count = ?6, attempt_count = ?7, last_error = ?8,
                 completed_at = ?9, claim_token = NULL, claimed_at = NULL,
                 pre_claim_status = NULL, updated_at = ?10
             WHERE id = ?1 AND claim_token = ?2 AND status = 'in_flight'",
            params![
                claim.item.id.as_str(),
                claim.claim_token,
                tr.status.as_str(),
                tr.next_run_at.map(ts),
                tr.occurrence_at.map(ts),
                tr.occurrence_count,
                tr.attempt_count,
                tr.last_error,
                tr.completed_at.map(ts),
                ts(now),
            ],
        )?;

        if n == 0 {
            clear_claim(&conn, claim)?;
            info!(item_id = %claim.item.id, "claim no longer held; outcome discarded");
            return Ok(Applied::Suppressed);
        }

        match tr.status {
            ItemStatus::Failed => warn!(
                item_id = %claim.item.id,
                attempts = tr.attempt_count,
                error = tr.last_error.as_deref().unwrap_or(""),
                "retry budget exhausted; item failed"
            ),
            status => info!(
                item_id = %claim.item.id,
                %status,
                occurrences = tr.occurrence_count,
                attempts = tr.attempt_count,
                "outcome applied"
            ),
        }
        Ok(Applied::Updated(tr))
    }

    /// Append one attempt-log row per platform result.
    pub fn record_attempts(
        &self,
        item_id: &ItemId,
        occurrence: u32,
        attempt: u32,
        results: &[PlatformResult],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO publish_attempts
                 (item_id, occurrence, attempt, platform, success, external_post_id, error, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            )?;
            for r in results {
                stmt.execute(params![
                    item_id.as_str(),
                    occurrence,
                    attempt,
                    r.platform.as_str(),
                    r.is_success(),
                    r.external_post_id,
                    r.error,
                    ts(now),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // --- diagnostics -------------------------------------------------------

    /// Attempt log for an item, oldest first.
    pub fn attempts(&self, item_id: &ItemId) -> Result<Vec<PublishAttempt>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, item_id, occurrence, attempt, platform, success,
                    external_post_id, error, created_at
             FROM publish_attempts WHERE item_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([item_id.as_str()], |row| {
                Ok(PublishAttempt {
                    id: row.get(0)?,
                    item_id: ItemId::from(row.get::<_, String>(1)?),
                    occurrence: row.get(2)?,
                    attempt: row.get(3)?,
                    platform: Platform::new(&row.get::<_, String>(4)?),
                    success: row.get(5)?,
                    external_post_id: row.get(6)?,
                    error: row.get(7)?,
                    created_at: ts_col(row, 8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Per-status counts, optionally for one owner.
    pub fn stats(&self, owner_id: Option<&OwnerId>) -> Result<ItemStats> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(occurrence_count), 0)
             FROM schedule_items
             WHERE (?1 IS NULL OR owner_id = ?1)
             GROUP BY status",
        )?;
        let rows = stmt
            .query_map(params![owner_id.map(OwnerId::as_str)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, u64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = ItemStats::default();
        for (status, count, published) in rows {
            stats.total += count;
            stats.total_published += published;
            match status.parse::<ItemStatus>() {
                Ok(ItemStatus::Pending) => stats.pending = count,
                Ok(ItemStatus::Active) => stats.active = count,
                Ok(ItemStatus::Paused) => stats.paused = count,
                Ok(ItemStatus::InFlight) => stats.in_flight = count,
                Ok(ItemStatus::Failed) => stats.failed = count,
                Ok(ItemStatus::Completed) => stats.completed = count,
                Ok(ItemStatus::Cancelled) => stats.cancelled = count,
                Err(e) => warn!("stats: {e}"),
            }
        }
        Ok(stats)
    }
}

fn not_found(id: &ItemId) -> SchedulerError {
    SchedulerError::ItemNotFound {
        id: id.to_string(),
    }
}

fn fetch(conn: &Connection, id: &ItemId) -> Result<Option<ScheduleItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM schedule_items WHERE id = ?1");
    Ok(conn.query_row(&sql, [id.as_str()], row_to_item).optional()?)
}

/// Drop claim fields without touching the status (item was cancelled mid-flight).
fn clear_claim(conn: &Connection, claim: &ClaimedItem) -> Result<()> {
    conn.execute(
        "UPDATE schedule_items
         SET claim_token = NULL, claimed_at = NULL, pre_claim_status = NULL
         WHERE id = ?1 AND claim_token = ?2",
        params![claim.item.id.as_str(), claim.claim_token],
    )?;
    Ok(())
}

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).map_err(|e| bad_column(idx, e.to_string()))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_ts(&s).map_err(|e| bad_column(idx, e.to_string())))
        .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| bad_column(idx, e.to_string()))
}

/// Map a row selected with [`ITEM_COLUMNS`] to a [`ScheduleItem`].
fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ScheduleItem> {
    let kind: ItemKind = row.get::<_, String>(5)?.parse().map_err(|e| bad_column(5, e))?;
    let status: ItemStatus = row.get::<_, String>(6)?.parse().map_err(|e| bad_column(6, e))?;
    let recurrence = row
        .get::<_, Option<String>>(9)?
        .map(|s| serde_json::from_str(&s).map_err(|e| bad_column(9, e.to_string())))
        .transpose()?;

    Ok(ScheduleItem {
        id: ItemId::from(row.get::<_, String>(0)?),
        owner_id: OwnerId::from(row.get::<_, String>(1)?),
        content: row.get(2)?,
        media_refs: json_col(row, 3)?,
        platforms: json_col(row, 4)?,
        kind,
        status,
        next_run_at: opt_ts_col(row, 7)?,
        occurrence_at: opt_ts_col(row, 8)?,
        recurrence,
        occurrence_count: row.get(10)?,
        attempt_count: row.get(11)?,
        max_attempts: row.get(12)?,
        last_error: row.get(13)?,
        claimed_at: opt_ts_col(row, 14)?,
        created_at: ts_col(row, 15)?,
        updated_at: ts_col(row, 16)?,
        completed_at: opt_ts_col(row, 17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Recurrence, RecurrencePattern};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap()
    }

    fn store() -> ItemStore {
        ItemStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn one_shot(store: &ItemStore, at: DateTime<Utc>) -> ScheduleItem {
        store
            .create(NewItem::one_shot("owner-1", "launch day", &["twitter"], at), 3, t0())
            .unwrap()
    }

    fn daily(store: &ItemStore, at: DateTime<Utc>) -> ScheduleItem {
        let req = NewItem::one_shot("owner-1", "good morning", &["twitter", "linkedin"], at)
            .recurring(Recurrence::new(RecurrencePattern::Daily, 1));
        store.create(req, 3, t0()).unwrap()
    }

    #[test]
    fn create_and_get_roundtrip() {
        let s = store();
        let req = NewItem::one_shot("owner-1", "hi", &["Twitter", "linkedin"], t0())
            .with_media(&["m-1", "m-2"]);
        let created = s.create(req, 3, t0()).unwrap();
        let got = s.get(&created.id).unwrap();
        assert_eq!(got.status, ItemStatus::Pending);
        assert_eq!(got.kind, ItemKind::OneShot);
        assert_eq!(got.media_refs, vec!["m-1", "m-2"]);
        assert_eq!(got.platforms[0].as_str(), "twitter");
        assert_eq!(got.next_run_at, Some(t0()));
        assert_eq!(got.max_attempts, 3);
    }

    #[test]
    fn invalid_create_is_not_persisted() {
        let s = store();
        let req = NewItem::one_shot("owner-1", "hi", &[], t0());
        assert!(matches!(
            s.create(req, 3, t0()),
            Err(SchedulerError::Validation(_))
        ));
        assert!(s.list(&ItemFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn get_unknown_is_not_found() {
        let s = store();
        assert!(matches!(
            s.get(&ItemId::from("nope")),
            Err(SchedulerError::ItemNotFound { .. })
        ));
    }

    #[test]
    fn list_filters_by_owner_and_status() {
        let s = store();
        let a = one_shot(&s, t0());
        let req = NewItem::one_shot("owner-2", "other", &["x"], t0());
        s.create(req, 3, t0()).unwrap();
        s.cancel(&a.id, t0()).unwrap();

        let mine = s
            .list(&ItemFilter {
                owner_id: Some(OwnerId::from("owner-1")),
                status: None,
            })
            .unwrap();
        assert_eq!(mine.len(), 1);

        let pending = s
            .list(&ItemFilter {
                owner_id: None,
                status: Some(ItemStatus::Pending),
            })
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].owner_id.as_str(), "owner-2");
    }

    #[test]
    fn due_ignores_future_paused_and_claimed() {
        let s = store();
        let due = one_shot(&s, t0());
        one_shot(&s, t0() + Duration::hours(1));
        let paused = daily(&s, t0());
        s.activate(&paused.id, t0()).unwrap();
        s.pause(&paused.id, t0()).unwrap();

        let listed = s.due(t0(), 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due.id);

        s.claim(&due.id, t0(), false).unwrap().unwrap();
        assert!(s.due(t0(), 10).unwrap().is_empty());
    }

    #[test]
    fn second_claim_loses() {
        let s = store();
        let item = one_shot(&s, t0());
        let first = s.claim(&item.id, t0(), false).unwrap();
        assert!(first.is_some());
        assert!(s.claim(&item.id, t0(), false).unwrap().is_none());
        assert_eq!(s.get(&item.id).unwrap().status, ItemStatus::InFlight);
    }

    #[test]
    fn claim_requires_due_time_unless_forced() {
        let s = store();
        let item = one_shot(&s, t0() + Duration::days(2));
        assert!(s.claim(&item.id, t0(), false).unwrap().is_none());
        let claimed = s.claim_now(&item.id, t0()).unwrap();
        assert_eq!(claimed.pre_claim_status, ItemStatus::Pending);
    }

    #[test]
    fn send_now_rejects_paused_and_in_flight() {
        let s = store();
        let item = daily(&s, t0());
        s.activate(&item.id, t0()).unwrap();
        s.pause(&item.id, t0()).unwrap();
        assert!(matches!(
            s.claim_now(&item.id, t0()),
            Err(SchedulerError::InvalidTransition { action: "send", .. })
        ));

        let other = one_shot(&s, t0());
        s.claim_now(&other.id, t0()).unwrap();
        assert!(s.claim_now(&other.id, t0()).is_err());
    }

    #[test]
    fn release_restores_pre_claim_status() {
        let s = store();
        let item = daily(&s, t0());
        s.activate(&item.id, t0()).unwrap();
        let claim = s.claim(&item.id, t0(), false).unwrap().unwrap();
        assert_eq!(claim.pre_claim_status, ItemStatus::Active);

        s.release(&claim, t0()).unwrap();
        let after = s.get(&item.id).unwrap();
        assert_eq!(after.status, ItemStatus::Active);
        assert_eq!(after.claimed_at, None);
        // claimable again
        assert!(s.claim(&item.id, t0(), false).unwrap().is_some());
    }

    #[test]
    fn update_only_while_pending() {
        let s = store();
        let item = one_shot(&s, t0());
        let upd = ItemUpdate {
            content: Some("edited".into()),
            schedule_time: Some(t0() + Duration::hours(3)),
            ..Default::default()
        };
        let updated = s.update(&item.id, upd, t0()).unwrap();
        assert_eq!(updated.content, "edited");
        assert_eq!(s.get(&item.id).unwrap().next_run_at, Some(t0() + Duration::hours(3)));

        s.cancel(&item.id, t0()).unwrap();
        let err = s
            .update(&item.id, ItemUpdate::default(), t0())
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidTransition { action: "update", status: ItemStatus::Cancelled }
        ));
    }

    #[test]
    fn update_validates_merged_item() {
        let s = store();
        let item = one_shot(&s, t0());
        let upd = ItemUpdate {
            platforms: Some(Vec::new()),
            ..Default::default()
        };
        assert!(matches!(
            s.update(&item.id, upd, t0()),
            Err(SchedulerError::Validation(_))
        ));
        // unchanged
        assert_eq!(s.get(&item.id).unwrap().platforms.len(), 1);
    }

    #[test]
    fn update_can_make_item_recurring() {
        let s = store();
        let item = one_shot(&s, t0());
        let upd = ItemUpdate {
            recurrence: Some(Recurrence::new(RecurrencePattern::Weekly, 2)),
            ..Default::default()
        };
        let updated = s.update(&item.id, upd, t0()).unwrap();
        assert_eq!(updated.kind, ItemKind::Recurring);
        assert_eq!(s.get(&item.id).unwrap().recurrence.unwrap().interval, 2);
    }

    #[test]
    fn activate_and_pause_rules() {
        let s = store();
        let oneshot = one_shot(&s, t0());
        assert!(matches!(
            s.activate(&oneshot.id, t0()),
            Err(SchedulerError::Validation(_))
        ));

        let rec = daily(&s, t0() + Duration::hours(1));
        assert!(s.pause(&rec.id, t0()).is_err(), "pending cannot be paused");
        assert_eq!(s.activate(&rec.id, t0()).unwrap().status, ItemStatus::Active);
        let paused = s.pause(&rec.id, t0()).unwrap();
        assert_eq!(paused.status, ItemStatus::Paused);
        assert_eq!(paused.next_run_at, rec.next_run_at);
        assert_eq!(s.activate(&rec.id, t0()).unwrap().status, ItemStatus::Active);
    }

    #[test]
    fn cancel_is_sticky() {
        let s = store();
        let item = one_shot(&s, t0());
        let cancelled = s.cancel(&item.id, t0()).unwrap();
        assert_eq!(cancelled.status, ItemStatus::Cancelled);
        assert_eq!(cancelled.next_run_at, None);
        assert!(s.cancel(&item.id, t0()).is_err());
        assert!(s.retry(&item.id, t0()).is_err());
    }

    #[test]
    fn outcome_after_cancel_is_suppressed() {
        let s = store();
        let item = one_shot(&s, t0());
        let claim = s.claim(&item.id, t0(), false).unwrap().unwrap();
        s.cancel(&item.id, t0()).unwrap();

        let applied = s
            .apply_outcome(&claim, &RunResult::Published, &RetryPolicy::default(), t0())
            .unwrap();
        assert_eq!(applied, Applied::Suppressed);

        let after = s.get(&item.id).unwrap();
        assert_eq!(after.status, ItemStatus::Cancelled);
        assert_eq!(after.occurrence_count, 0);
        assert_eq!(after.claimed_at, None);
    }

    #[test]
    fn failure_then_owner_retry() {
        let s = store();
        let req = NewItem::one_shot("owner-1", "x", &["a"], t0());
        let item = s.create(req, 1, t0()).unwrap();
        let claim = s.claim(&item.id, t0(), false).unwrap().unwrap();
        s.apply_outcome(
            &claim,
            &RunResult::Failed("a: 500".into()),
            &RetryPolicy::default(),
            t0(),
        )
        .unwrap();

        let failed = s.get(&item.id).unwrap();
        assert_eq!(failed.status, ItemStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("a: 500"));
        // failed items are never claimed again on their own
        assert!(s.claim_due(t0() + Duration::days(1), 10).unwrap().is_empty());

        let later = t0() + Duration::hours(2);
        let retried = s.retry(&item.id, later).unwrap();
        assert_eq!(retried.status, ItemStatus::Pending);
        assert_eq!(retried.attempt_count, 0);
        assert_eq!(retried.next_run_at, Some(later));
        assert_eq!(s.claim_due(later, 10).unwrap().len(), 1);
    }

    #[test]
    fn schedule_past_year_9999_is_rejected() {
        let s = store();
        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        let req = NewItem::one_shot("owner-1", "far", &["twitter"], far);
        assert!(matches!(s.create(req, 3, t0()), Err(SchedulerError::Validation(_))));

        let req = NewItem::one_shot("owner-1", "far", &["twitter"], t0())
            .recurring(Recurrence::new(RecurrencePattern::Daily, 1).until(far));
        assert!(matches!(s.create(req, 3, t0()), Err(SchedulerError::Validation(_))));

        let item = one_shot(&s, t0() + Duration::hours(1));
        let upd = ItemUpdate {
            schedule_time: Some(far),
            ..Default::default()
        };
        assert!(matches!(s.update(&item.id, upd, t0()), Err(SchedulerError::Validation(_))));

        assert_eq!(s.list(&ItemFilter::default()).unwrap().len(), 1);
        assert!(s.claim_due(t0(), 10).unwrap().is_empty());
    }

    #[test]
    fn huge_custom_step_completes_instead_of_overflowing_the_year() {
        let s = store();
        let req = NewItem::one_shot("owner-1", "rare", &["twitter"], t0())
            .recurring(Recurrence::new(RecurrencePattern::Custom, 70_000_000));
        let item = s.create(req, 3, t0()).unwrap();
        let claim = s.claim(&item.id, t0(), false).unwrap().unwrap();
        s.apply_outcome(&claim, &RunResult::Published, &RetryPolicy::default(), t0())
            .unwrap();

        let after = s.get(&item.id).unwrap();
        assert_eq!(after.status, ItemStatus::Completed);
        assert_eq!(after.next_run_at, None);
        assert_eq!(s.list(&ItemFilter::default()).unwrap().len(), 1);
        assert!(s.claim_due(t0() + Duration::days(1), 10).unwrap().is_empty());
    }

    #[test]
    fn abandoned_claim_is_reaped_after_its_lease() {
        let s = store();
        let item = daily(&s, t0());
        let lease = Duration::minutes(10);
        let policy = RetryPolicy::default();
        // claim taken, worker never reports back
        drop(s.claim(&item.id, t0(), false).unwrap().unwrap());

        assert_eq!(s.reap_expired(t0() + Duration::minutes(9), lease, &policy, 10).unwrap(), 0);
        assert_eq!(s.get(&item.id).unwrap().status, ItemStatus::InFlight);

        let later = t0() + Duration::minutes(10);
        assert_eq!(s.reap_expired(later, lease, &policy, 10).unwrap(), 1);
        let reaped = s.get(&item.id).unwrap();
        assert_eq!(reaped.status, ItemStatus::Pending);
        assert_eq!(reaped.attempt_count, 1);
        assert_eq!(reaped.claimed_at, None);
        assert!(reaped.last_error.as_deref().unwrap().contains("claim expired"));
        assert_eq!(s.attempts(&item.id).unwrap().len(), 2);

        let retry_at = reaped.next_run_at.unwrap();
        assert!(retry_at > later);
        assert_eq!(s.claim_due(retry_at, 10).unwrap().len(), 1);
    }

    #[test]
    fn reaped_claim_cannot_publish_or_write_back() {
        let s = store();
        let req = NewItem::one_shot("owner-1", "x", &["a"], t0());
        let item = s.create(req, 1, t0()).unwrap();
        let claim = s.claim(&item.id, t0(), false).unwrap().unwrap();
        let later = t0() + Duration::hours(1);
        s.reap_expired(later, Duration::minutes(10), &RetryPolicy::default(), 10)
            .unwrap();
        assert_eq!(s.get(&item.id).unwrap().status, ItemStatus::Failed);

        assert!(!s.renew_claim(&claim, later).unwrap());
        let applied = s
            .apply_outcome(&claim, &RunResult::Published, &RetryPolicy::default(), later)
            .unwrap();
        assert_eq!(applied, Applied::Suppressed);
        assert_eq!(s.get(&item.id).unwrap().status, ItemStatus::Failed);
    }

    #[test]
    fn renewed_claim_outlives_the_original_lease() {
        let s = store();
        let item = one_shot(&s, t0());
        let claim = s.claim(&item.id, t0(), false).unwrap().unwrap();
        let lease = Duration::minutes(10);
        assert!(s.renew_claim(&claim, t0() + Duration::minutes(8)).unwrap());

        let at = t0() + Duration::minutes(12);
        assert_eq!(s.reap_expired(at, lease, &RetryPolicy::default(), 10).unwrap(), 0);
        assert_eq!(s.get(&item.id).unwrap().status, ItemStatus::InFlight);
    }

    #[test]
    fn reaper_clears_claim_left_on_cancelled_item() {
        let s = store();
        let item = one_shot(&s, t0());
        s.claim(&item.id, t0(), false).unwrap().unwrap();
        s.cancel(&item.id, t0()).unwrap();

        let later = t0() + Duration::hours(1);
        assert_eq!(s.reap_expired(later, Duration::minutes(10), &RetryPolicy::default(), 10).unwrap(), 0);
        let after = s.get(&item.id).unwrap();
        assert_eq!(after.status, ItemStatus::Cancelled);
        assert_eq!(after.claimed_at, None);
    }

    #[test]
    fn delete_removes_item_and_attempts_but_not_in_flight() {
        let s = store();
        let item = one_shot(&s, t0());
        let claim = s.claim(&item.id, t0(), false).unwrap().unwrap();
        assert!(matches!(
            s.delete(&item.id),
            Err(SchedulerError::InvalidTransition { action: "delete", .. })
        ));

        s.record_attempts(
            &item.id,
            1,
            1,
            &[PlatformResult::ok(Platform::new("twitter"), Some("tw-1".into()))],
            t0(),
        )
        .unwrap();
        s.apply_outcome(&claim, &RunResult::Published, &RetryPolicy::default(), t0())
            .unwrap();
        assert_eq!(s.attempts(&item.id).unwrap().len(), 1);

        s.delete(&item.id).unwrap();
        assert!(s.get(&item.id).is_err());
        assert!(s.attempts(&item.id).unwrap().is_empty());
        assert!(matches!(
            s.delete(&item.id),
            Err(SchedulerError::ItemNotFound { .. })
        ));
    }

    #[test]
    fn attempt_log_keeps_order_and_detail() {
        let s = store();
        let item = one_shot(&s, t0());
        s.record_attempts(
            &item.id,
            1,
            1,
            &[
                PlatformResult::ok(Platform::new("a"), Some("a-77".into())),
                PlatformResult::failed(Platform::new("b"), "timed out after 60s"),
            ],
            t0(),
        )
        .unwrap();

        let log = s.attempts(&item.id).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].success);
        assert_eq!(log[0].external_post_id.as_deref(), Some("a-77"));
        assert!(!log[1].success);
        assert_eq!(log[1].error.as_deref(), Some("timed out after 60s"));
    }

    #[test]
    fn stats_count_by_status() {
        let s = store();
        let a = one_shot(&s, t0());
        one_shot(&s, t0());
        let r = daily(&s, t0());
        s.activate(&r.id, t0()).unwrap();
        let claim = s.claim(&a.id, t0(), false).unwrap().unwrap();
        s.apply_outcome(&claim, &RunResult::Published, &RetryPolicy::default(), t0())
            .unwrap();

        let stats = s.stats(Some(&OwnerId::from("owner-1"))).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total_published, 1);

        assert_eq!(s.stats(Some(&OwnerId::from("nobody"))).unwrap(), ItemStats::default());
    }

    #[test]
    fn concurrent_scanners_claim_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.db");
        let timeout = std::time::Duration::from_secs(5);

        let seed = ItemStore::new(crate::db::open(&path, timeout).unwrap()).unwrap();
        let item = one_shot(&seed, t0());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = ItemStore::new(crate::db::open(&path, timeout).unwrap()).unwrap();
                    store.claim_due(t0(), 10).unwrap().len()
                })
            })
            .collect();

        let won: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(won, 1);
        assert_eq!(seed.get(&item.id).unwrap().status, ItemStatus::InFlight);
    }
}
