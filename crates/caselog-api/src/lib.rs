use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use caselog_core::{
    create_record, delete_record, delete_record_row, is_authorized, load_authorized_users,
    load_taxonomy, query_page, summarize, update_record, update_record_row, CellValue,
    DashboardSummary, QueryPage, RecordDraft, RecordFilter, RecordId, RecordIndex, RecordPatch,
    TabularStore, TAXONOMY_TABLE, USERS_TABLE,
};
use caselog_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Uniform result of a mutating operation, surfaced to clients verbatim.
/// Failures carry the error description in `message`; nothing escapes this
/// boundary as an exception.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
}

/// Operation facade over the workbook. Every call opens the store at
/// `db_path`, migrates it, runs to completion, and returns; there is no
/// session state and no caching between calls.
#[derive(Debug, Clone)]
pub struct CaselogApi {
    db_path: PathBuf,
}

impl CaselogApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn run_mutation(
        &self,
        operation: &'static str,
        success_message: &str,
        run: impl FnOnce(&mut SqliteStore) -> Result<Option<RecordId>>,
    ) -> MutationOutcome {
        match self.open_store().and_then(|mut store| run(&mut store)) {
            Ok(record_id) => {
                tracing::info!(operation, "mutation applied");
                MutationOutcome { success: true, message: success_message.to_string(), record_id }
            }
            Err(err) => {
                tracing::warn!(operation, error = %err, "mutation rejected");
                MutationOutcome { success: false, message: err.to_string(), record_id: None }
            }
        }
    }

    /// Append one record, creating the data table on first use.
    #[must_use]
    pub fn create_record(&self, draft: RecordDraft) -> MutationOutcome {
        self.run_mutation("create_record", "record saved", |store| {
            let id = create_record(store, draft)?;
            Ok(Some(id))
        })
    }

    /// Partial update addressed by surrogate id.
    #[must_use]
    pub fn update_record(&self, id: RecordId, patch: &RecordPatch) -> MutationOutcome {
        self.run_mutation("update_record", "record updated", |store| {
            let mut index = RecordIndex::new();
            update_record(store, &mut index, id, patch)?;
            Ok(Some(id))
        })
    }

    /// Partial update addressed by physical row index.
    #[must_use]
    pub fn update_row(&self, row_index: usize, patch: &RecordPatch) -> MutationOutcome {
        self.run_mutation("update_row", "record updated", |store| {
            update_record_row(store, row_index, patch)?;
            Ok(None)
        })
    }

    /// Delete addressed by surrogate id. Later rows shift up by one.
    #[must_use]
    pub fn delete_record(&self, id: RecordId) -> MutationOutcome {
        self.run_mutation("delete_record", "record deleted", |store| {
            let mut index = RecordIndex::new();
            delete_record(store, &mut index, id)?;
            Ok(Some(id))
        })
    }

    /// Delete addressed by physical row index. Later rows shift up by one.
    #[must_use]
    pub fn delete_row(&self, row_index: usize) -> MutationOutcome {
        self.run_mutation("delete_row", "record deleted", |store| {
            delete_record_row(store, row_index)?;
            Ok(None)
        })
    }

    /// Filtered, paginated listing. An absent data table is a valid empty
    /// state.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn query_records(
        &self,
        page_number: usize,
        page_size: usize,
        filter: &RecordFilter,
    ) -> Result<QueryPage> {
        let store = self.open_store()?;
        let page = query_page(&store, page_number, page_size, filter)?;
        tracing::debug!(page_number, page_size, total = page.total_records, "records queried");
        Ok(page)
    }

    /// Dashboard counters over a full unfiltered scan, evaluated at the
    /// current instant.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn dashboard(&self) -> Result<DashboardSummary> {
        let store = self.open_store()?;
        let summary = summarize(&store, OffsetDateTime::now_utc())?;
        tracing::debug!(
            total = summary.total_records,
            reviewed = summary.status_reviewed,
            recent = summary.recent_records,
            "dashboard summarized"
        );
        Ok(summary)
    }

    /// Subject → Sub Subject map for dependent dropdowns.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn taxonomy(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let store = self.open_store()?;
        let map = load_taxonomy(&store)?;
        tracing::debug!(subjects = map.len(), "taxonomy loaded");
        Ok(map)
    }

    /// The allowlist, rebuilt from the store on every call.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn authorized_users(&self) -> Result<BTreeSet<String>> {
        let store = self.open_store()?;
        Ok(load_authorized_users(&store)?)
    }

    /// Allowlist membership for one email. No caching: the allowlist is
    /// reloaded on every check, so edits take effect immediately.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn is_authorized(&self, email: &str) -> Result<bool> {
        let authorized = self.authorized_users()?;
        let allowed = is_authorized(email, &authorized);
        if !allowed {
            tracing::info!(email, "access denied");
        }
        Ok(allowed)
    }

    /// Append one email to the allowlist table, creating it on first use.
    /// The allowlist sheet has no header row.
    #[must_use]
    pub fn add_user(&self, email: &str) -> MutationOutcome {
        let email = email.trim().to_lowercase();
        self.run_mutation("add_user", "user added", move |store| {
            if email.is_empty() {
                return Err(anyhow!("email must not be empty"));
            }
            if !store.table_exists(USERS_TABLE)? {
                store.create_table(USERS_TABLE, &[])?;
            }
            store.append_row(USERS_TABLE, &[CellValue::text(email)])?;
            Ok(None)
        })
    }

    /// Append one Subject / Sub Subject pair, creating the taxonomy table
    /// with its header on first use. An empty sub-subject marks a standalone
    /// subject.
    #[must_use]
    pub fn add_taxonomy_entry(&self, subject: &str, sub_subject: &str) -> MutationOutcome {
        let subject = subject.trim().to_string();
        let sub_subject = sub_subject.trim().to_string();
        self.run_mutation("add_taxonomy_entry", "taxonomy entry added", move |store| {
            if subject.is_empty() {
                return Err(anyhow!("subject must not be empty"));
            }
            if !store.table_exists(TAXONOMY_TABLE)? {
                store.create_table(TAXONOMY_TABLE, &["Subject", "Sub Subject"])?;
            }
            store.append_row(
                TAXONOMY_TABLE,
                &[CellValue::text(subject), CellValue::text(sub_subject)],
            )?;
            Ok(None)
        })
    }
}

#[cfg(test)]
mod tests {
    use caselog_core::{Field, PatchField};

    use super::*;

    fn temp_api() -> (CaselogApi, PathBuf) {
        let db_path =
            std::env::temp_dir().join(format!("caselog-api-{}.sqlite3", ulid::Ulid::new()));
        (CaselogApi::new(db_path.clone()), db_path)
    }

    fn draft(status: &str, interested_party: &str) -> RecordDraft {
        RecordDraft {
            status: status.to_string(),
            interested_party: interested_party.to_string(),
            subject: "Contract".to_string(),
            ..RecordDraft::default()
        }
    }

    fn must_page(api: &CaselogApi) -> QueryPage {
        match api.query_records(1, 50, &RecordFilter::default()) {
            Ok(page) => page,
            Err(err) => panic!("query failed: {err}"),
        }
    }

    #[test]
    fn create_query_update_delete_round_trip() {
        let (api, db_path) = temp_api();

        let created = api.create_record(draft("Open", "Alice"));
        assert!(created.success, "create failed: {}", created.message);
        let id = match created.record_id {
            Some(id) => id,
            None => panic!("create outcome is missing the record id"),
        };

        let page = must_page(&api);
        assert_eq!(page.total_records, 1);
        assert_eq!(page.data[0].record_id, Some(id));

        let patch = RecordPatch {
            status: PatchField::Set("Reviewed".to_string()),
            ..RecordPatch::default()
        };
        let updated = api.update_record(id, &patch);
        assert!(updated.success, "update failed: {}", updated.message);

        let page = must_page(&api);
        assert_eq!(
            page.data[0].cells[Field::Status.column() - 1],
            CellValue::Text("Reviewed".to_string())
        );
        assert_eq!(
            page.data[0].cells[Field::InterestedParty.column() - 1],
            CellValue::Text("Alice".to_string())
        );

        let deleted = api.delete_record(id);
        assert!(deleted.success, "delete failed: {}", deleted.message);
        assert_eq!(must_page(&api).total_records, 0);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn mutation_failures_become_outcomes_not_errors() {
        let (api, db_path) = temp_api();

        let outcome = api.delete_row(1);
        assert!(!outcome.success);
        assert!(outcome.message.contains("not found"), "message: {}", outcome.message);

        let _ = api.create_record(draft("Open", "Alice"));
        let outcome = api.delete_row(1);
        assert!(!outcome.success);
        assert!(outcome.message.contains("row index 1"), "message: {}", outcome.message);

        let outcome = api.delete_row(9);
        assert!(!outcome.success);
        // The rejected deletes left the table untouched.
        assert_eq!(must_page(&api).total_records, 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn allowlist_checks_are_case_insensitive_and_fail_closed() {
        let (api, db_path) = temp_api();

        match api.is_authorized("alice@example.com") {
            Ok(allowed) => assert!(!allowed),
            Err(err) => panic!("is_authorized failed: {err}"),
        }

        let added = api.add_user("  Alice@Example.COM ");
        assert!(added.success, "add_user failed: {}", added.message);

        match api.is_authorized("ALICE@example.com") {
            Ok(allowed) => assert!(allowed),
            Err(err) => panic!("is_authorized failed: {err}"),
        }
        match api.is_authorized("bob@example.com") {
            Ok(allowed) => assert!(!allowed),
            Err(err) => panic!("is_authorized failed: {err}"),
        }

        let rejected = api.add_user("   ");
        assert!(!rejected.success);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn taxonomy_entries_round_trip_including_standalone_subjects() {
        let (api, db_path) = temp_api();

        for (subject, sub_subject) in
            [("Contract", "Nonexempt"), ("Contract", "Payment"), ("Supply", "")]
        {
            let outcome = api.add_taxonomy_entry(subject, sub_subject);
            assert!(outcome.success, "add failed: {}", outcome.message);
        }

        let map = match api.taxonomy() {
            Ok(map) => map,
            Err(err) => panic!("taxonomy failed: {err}"),
        };
        assert_eq!(
            map.get("Contract").map(Vec::as_slice),
            Some(["Nonexempt".to_string(), "Payment".to_string()].as_slice())
        );
        assert_eq!(map.get("Supply").map(Vec::as_slice), Some([].as_slice()));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn dashboard_reflects_status_and_recent_entries() {
        let (api, db_path) = temp_api();

        let today = OffsetDateTime::now_utc().date();
        let recent = RecordDraft { entry_date: Some(today), ..draft("Reviewed", "Alice") };
        let _ = api.create_record(recent);
        let _ = api.create_record(draft("Open", "Bob"));

        let summary = match api.dashboard() {
            Ok(summary) => summary,
            Err(err) => panic!("dashboard failed: {err}"),
        };
        assert_eq!(summary.total_records, 2);
        assert_eq!(summary.status_reviewed, 1);
        assert_eq!(summary.recent_records, 1);

        let _ = std::fs::remove_file(&db_path);
    }
}
