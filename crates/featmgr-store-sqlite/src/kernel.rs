use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::path::Path;

use anyhow::{Context, Result};
use featmgr_core::kernel::{admit_usage_report, admit_write, mark_subscribed};
use featmgr_core::{
    ChangeCallback, FeatureConfiguration, FeatureConfigurationSection, FeatureConfigurationUpdate,
    FeatureSyscalls, FeatureUsageReport, FeatureUsageSubscription, NotificationHandle, NtStatus,
    SectionState,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::schema::{now_rfc3339, open_connection};

const CHANGE_STAMP_KEY: &str = "change_stamp";

struct Notification {
    callback: ChangeCallback,
    wait_for: Option<u64>,
}

/// [`FeatureSyscalls`] emulated on top of SQLite so state survives across
/// processes. Change notifications are process-local.
pub struct SqliteFeatureKernel {
    conn: Connection,
    notifications: BTreeMap<u64, Notification>,
    next_handle: u64,
}

impl Debug for SqliteFeatureKernel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteFeatureKernel")
            .field("conn", &self.conn)
            .field("notifications", &self.notifications.len())
            .finish()
    }
}

impl SqliteFeatureKernel {
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: open_connection(path)?, notifications: BTreeMap::new(), next_handle: 0 })
    }

    /// Store records directly, bypassing the write rules. Used to load tiers
    /// only the OS may write, such as `ImageDefault`.
    ///
    /// # Errors
    /// Returns an error when the records cannot be written.
    pub fn seed(
        &mut self,
        section: FeatureConfigurationSection,
        records: &[FeatureConfiguration],
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let mut state = read_section(&tx, section)?;
        for record in records {
            state.insert(*record);
        }
        save_section(&tx, section, &state)?;
        tx.commit().context("failed to commit seeded records")?;
        Ok(())
    }

    /// Usage reports accepted so far, oldest first.
    ///
    /// # Errors
    /// Returns an error when the reports cannot be read.
    pub fn usage_reports(&self) -> Result<Vec<FeatureUsageReport>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT feature_id, reporting_kind, reporting_options
                 FROM usage_reports ORDER BY id",
            )
            .context("failed to prepare usage report listing")?;
        let rows = stmt.query_map([], |row| {
            Ok(FeatureUsageReport {
                feature_id: row.get(0)?,
                reporting_kind: row.get(1)?,
                reporting_options: row.get(2)?,
            })
        })?;
        let mut reports = Vec::new();
        for row in rows {
            reports.push(row?);
        }
        Ok(reports)
    }

    fn load_section(&self, section: FeatureConfigurationSection) -> Result<SectionState> {
        read_section(&self.conn, section)
    }

    fn change_stamp(&self) -> Result<u64> {
        read_change_stamp(&self.conn)
    }

    fn subscriptions(&self) -> Result<Vec<(i64, FeatureUsageSubscription)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, feature_id, reporting_kind, reporting_options, reporting_target
                 FROM usage_subscriptions ORDER BY id",
            )
            .context("failed to prepare subscription listing")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                FeatureUsageSubscription {
                    feature_id: row.get(1)?,
                    reporting_kind: row.get(2)?,
                    reporting_options: row.get(3)?,
                    reporting_target: u64::from_le_bytes(row.get::<_, i64>(4)?.to_le_bytes()),
                },
            ))
        })?;
        let mut subscriptions = Vec::new();
        for row in rows {
            subscriptions.push(row?);
        }
        Ok(subscriptions)
    }

    fn live_subscriptions(&self) -> Result<Vec<FeatureUsageSubscription>> {
        Ok(self.subscriptions()?.into_iter().map(|(_, subscription)| subscription).collect())
    }

    fn write_runtime(
        &mut self,
        updates: &[FeatureConfigurationUpdate],
        previous_change_stamp: u64,
    ) -> Result<Result<u64, NtStatus>> {
        // The write lock is taken before the stamp is read so concurrent
        // writers serialize on it.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let current = read_change_stamp(&tx)?;
        if let Err(status) =
            admit_write(FeatureConfigurationSection::Runtime, previous_change_stamp, current)
        {
            return Ok(Err(status));
        }

        let mut state = read_section(&tx, FeatureConfigurationSection::Runtime)?;
        if state.apply_all(updates).is_err() {
            return Ok(Err(NtStatus::INVALID_PARAMETER));
        }

        let next = current + 1;
        save_section(&tx, FeatureConfigurationSection::Runtime, &state)?;
        tx.execute(
            "INSERT INTO kernel_state(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![CHANGE_STAMP_KEY, i64::try_from(next).context("change stamp overflow")?],
        )
        .context("failed to store change stamp")?;
        tx.commit().context("failed to commit feature configuration batch")?;

        for notification in self.notifications.values_mut() {
            let due = match notification.wait_for {
                Some(wait_for) => next > wait_for,
                None => true,
            };
            if due {
                (notification.callback)(next);
            }
        }
        Ok(Ok(next))
    }
}

fn read_section(conn: &Connection, section: FeatureConfigurationSection) -> Result<SectionState> {
    let mut stmt = conn
        .prepare(
            "SELECT feature_id, compact_state, variant_payload
             FROM feature_configurations WHERE section = ?1
             ORDER BY feature_id, priority",
        )
        .context("failed to prepare feature configuration listing")?;
    let rows = stmt.query_map(params![section.as_str()], |row| {
        Ok(FeatureConfiguration::from_parts(row.get(0)?, row.get(1)?, row.get(2)?))
    })?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(SectionState::from_records(records))
}

fn read_change_stamp(conn: &Connection) -> Result<u64> {
    let stamp = conn
        .query_row(
            "SELECT value FROM kernel_state WHERE key = ?1",
            params![CHANGE_STAMP_KEY],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .context("failed to read change stamp")?
        .unwrap_or(0);
    u64::try_from(stamp).context("stored change stamp is negative")
}

fn save_section(
    tx: &rusqlite::Transaction<'_>,
    section: FeatureConfigurationSection,
    state: &SectionState,
) -> Result<()> {
    tx.execute("DELETE FROM feature_configurations WHERE section = ?1", params![section.as_str()])
        .context("failed to clear section")?;
    for record in state.records() {
        tx.execute(
            "INSERT INTO feature_configurations(
                section, feature_id, priority, compact_state, variant_payload
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                section.as_str(),
                record.feature_id(),
                record.priority().value(),
                record.compact_state(),
                record.variant_payload(),
            ],
        )
        .with_context(|| format!("failed to store feature {}", record.feature_id()))?;
    }
    Ok(())
}

fn native(err: &anyhow::Error) -> NtStatus {
    tracing::warn!(error = %format!("{err:#}"), "sqlite kernel call failed");
    NtStatus::UNSUCCESSFUL
}

impl FeatureSyscalls for SqliteFeatureKernel {
    fn query_feature_configurations(
        &self,
        section: FeatureConfigurationSection,
    ) -> Result<(Vec<FeatureConfiguration>, u64), NtStatus> {
        let load = || -> Result<(Vec<FeatureConfiguration>, u64)> {
            let mut records = self.load_section(section)?.records();
            mark_subscribed(&mut records, &self.live_subscriptions()?);
            Ok((records, self.change_stamp()?))
        };
        load().map_err(|err| native(&err))
    }

    fn query_feature_configuration(
        &self,
        feature_id: u32,
        section: FeatureConfigurationSection,
    ) -> Result<(FeatureConfiguration, u64), NtStatus> {
        let load = || -> Result<Option<(FeatureConfiguration, u64)>> {
            let Some(record) = self.load_section(section)?.resolve(feature_id) else {
                return Ok(None);
            };
            let mut records = [record];
            mark_subscribed(&mut records, &self.live_subscriptions()?);
            Ok(Some((records[0], self.change_stamp()?)))
        };
        load().map_err(|err| native(&err))?.ok_or(NtStatus::NOT_FOUND)
    }

    fn query_change_stamp(&self) -> Result<u64, NtStatus> {
        self.change_stamp().map_err(|err| native(&err))
    }

    fn set_feature_configurations(
        &mut self,
        section: FeatureConfigurationSection,
        updates: &[FeatureConfigurationUpdate],
        previous_change_stamp: u64,
    ) -> Result<u64, NtStatus> {
        if section == FeatureConfigurationSection::Boot {
            return Err(NtStatus::INVALID_PARAMETER);
        }
        self.write_runtime(updates, previous_change_stamp).map_err(|err| native(&err))?
    }

    fn register_change_notification(
        &mut self,
        callback: ChangeCallback,
        wait_for: Option<u64>,
    ) -> Result<NotificationHandle, NtStatus> {
        self.next_handle += 1;
        self.notifications.insert(self.next_handle, Notification { callback, wait_for });
        Ok(NotificationHandle(self.next_handle))
    }

    fn unregister_change_notification(
        &mut self,
        handle: NotificationHandle,
    ) -> Result<(), NtStatus> {
        self.notifications
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(NtStatus::INVALID_PARAMETER)
    }

    fn query_usage_subscriptions(&self) -> Result<Vec<FeatureUsageSubscription>, NtStatus> {
        self.live_subscriptions().map_err(|err| native(&err))
    }

    fn subscribe_usage_notifications(
        &mut self,
        subscriptions: &[FeatureUsageSubscription],
    ) -> Result<(), NtStatus> {
        let mut insert = || -> Result<()> {
            let tx = self.conn.transaction().context("failed to start transaction")?;
            for subscription in subscriptions {
                tx.execute(
                    "INSERT INTO usage_subscriptions(
                        feature_id, reporting_kind, reporting_options, reporting_target
                    ) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        subscription.feature_id,
                        subscription.reporting_kind,
                        subscription.reporting_options,
                        i64::from_le_bytes(subscription.reporting_target.to_le_bytes()),
                    ],
                )
                .context("failed to insert usage subscription")?;
            }
            tx.commit().context("failed to commit usage subscriptions")?;
            Ok(())
        };
        insert().map_err(|err| native(&err))
    }

    fn unsubscribe_usage_notifications(
        &mut self,
        subscriptions: &[FeatureUsageSubscription],
    ) -> Result<(), NtStatus> {
        let mut remove = || -> Result<()> {
            let doomed: Vec<i64> = self
                .subscriptions()?
                .into_iter()
                .filter(|(_, live)| subscriptions.iter().any(|removed| removed.matches_live(live)))
                .map(|(id, _)| id)
                .collect();
            let tx = self.conn.transaction().context("failed to start transaction")?;
            for id in doomed {
                tx.execute("DELETE FROM usage_subscriptions WHERE id = ?1", params![id])
                    .context("failed to delete usage subscription")?;
            }
            tx.commit().context("failed to commit usage subscription removal")?;
            Ok(())
        };
        remove().map_err(|err| native(&err))
    }

    fn notify_feature_usage(&mut self, report: &FeatureUsageReport) -> Result<(), NtStatus> {
        let subscriptions = self.live_subscriptions().map_err(|err| native(&err))?;
        admit_usage_report(report, &subscriptions)?;
        let record = || -> Result<()> {
            self.conn
                .execute(
                    "INSERT INTO usage_reports(
                        feature_id, reporting_kind, reporting_options, reported_at
                    ) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        report.feature_id,
                        report.reporting_kind,
                        report.reporting_options,
                        now_rfc3339()?,
                    ],
                )
                .context("failed to record usage report")?;
            Ok(())
        };
        record().map_err(|err| native(&err))
    }

    fn get_system_boot_status(&self, item: u32) -> Result<u32, NtStatus> {
        self.conn
            .query_row("SELECT value FROM boot_status WHERE item = ?1", params![item], |row| {
                row.get::<_, u32>(0)
            })
            .optional()
            .context("failed to read boot status")
            .map(Option::unwrap_or_default)
            .map_err(|err| native(&err))
    }

    fn set_system_boot_status(&mut self, item: u32, value: u32) -> Result<(), NtStatus> {
        self.conn
            .execute(
                "INSERT INTO boot_status(item, value) VALUES (?1, ?2)
                 ON CONFLICT(item) DO UPDATE SET value = excluded.value",
                params![item, value],
            )
            .context("failed to write boot status")
            .map(|_| ())
            .map_err(|err| native(&err))
    }

    fn create_boot_status_data_file(&mut self) -> Result<(), NtStatus> {
        self.conn
            .execute("DELETE FROM boot_status", [])
            .context("failed to reset boot status data")
            .map(|_| ())
            .map_err(|err| native(&err))
    }
}
