//! Reply drafts: persistence, auto-send decisions and stale-send recovery.

pub mod db;
pub mod decision;
pub mod recovery;
pub mod store;

pub use decision::AutoSendDecisionRecorder;
pub use recovery::{StaleDraftRecovery, SweepReport, disposition};
pub use store::{
    AutoSendDecision, DraftFailure, DraftStore, InMemoryDraftStore, NewDraft, StaleDraft, WriteCondition,
};
