use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::model::{BpkError, PersonId, PersonUpdate};
use crate::store::BpkStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeOutcome {
    pub merged: bool,
    /// The single valid-bPK holder, when one was found.
    pub holder: Option<PersonId>,
    /// Identity attributes copied from the holder onto the main person.
    pub changed_attributes: Vec<String>,
    /// Audit notes, in the order the steps ran.
    pub details: Vec<String>,
}

/// Reconcile bPK sub-records before `others` are merged into `main`.
///
/// With exactly one valid-bPK holder among all involved persons, the holder's
/// record and identity attributes end up on `main`, every other record is
/// deleted, and `main` keeps the vbPK it had before the call (if any).
/// Without a holder nothing changes.
///
/// # Errors
/// Returns [`BpkError::Validation`] when `main` does not exist,
/// [`BpkError::MultipleValidHolders`] (before any mutation) when more than one
/// person holds a verified bPK, and propagates store failures. There is no
/// rollback: steps applied before a store failure stay applied.
pub fn resolve_merge<S>(
    store: &mut S,
    main: PersonId,
    others: &[PersonId],
) -> Result<MergeOutcome, BpkError>
where
    S: BpkStore + ?Sized,
{
    if store.person(main)?.is_none() {
        return Err(BpkError::Validation(format!("main person {main} not found")));
    }

    let main_vbpk = store.bpk_record(main)?.map(|record| record.vbpk).unwrap_or_default();

    let involved: BTreeSet<PersonId> =
        std::iter::once(main).chain(others.iter().copied()).collect();
    let mut holders = Vec::new();
    for person_id in &involved {
        if store.bpk_record(*person_id)?.is_some_and(|record| record.is_valid_holder()) {
            holders.push(*person_id);
        }
    }

    let holder = match holders.as_slice() {
        [] => {
            debug!(main, ?others, "no valid bPK holder, nothing to merge");
            return Ok(MergeOutcome::default());
        }
        [holder] => *holder,
        _ => {
            error!(main, ?holders, "cannot merge multiple valid bPKs");
            return Err(BpkError::MultipleValidHolders(holders));
        }
    };

    let mut outcome =
        MergeOutcome { merged: true, holder: Some(holder), ..MergeOutcome::default() };

    for person_id in involved.iter().filter(|person_id| **person_id != holder) {
        store.delete_bpk_record(*person_id)?;
        debug!(person_id = *person_id, "deleted bPK record of non-holder");
    }

    // Main's own record is only deleted when it is not the holder; deleting it here would drop
    // the verified bPK.
    if holder != main {
        let holder_person = store
            .person(holder)?
            .ok_or_else(|| BpkError::Store(format!("person {holder} not found")))?;
        let main_person = store
            .person(main)?
            .ok_or_else(|| BpkError::Store(format!("person {main} not found")))?;

        let update = PersonUpdate {
            first_name: Some(holder_person.first_name),
            last_name: Some(holder_person.last_name),
            birth_date: holder_person.birth_date,
        };
        let changed = update.changed_attributes(&main_person);
        if !changed.is_empty() {
            store.update_person(main, &update)?;
            outcome.details.push(format!(
                "Attributes {} copied from bPK record holder contact [{holder}]",
                changed.join(", ")
            ));
            outcome.changed_attributes = changed.into_iter().map(str::to_string).collect();
        }

        // The identity update above resets main's record; drop it before the move.
        store.delete_bpk_record(main)?;
        store.move_bpk_record(holder, main)?;
        outcome.details.push(format!("Moved bPK record from contact [{holder}]"));
        debug!(holder, main, "moved bPK record");
    }

    if !main_vbpk.is_empty() {
        let moved_vbpk = store.bpk_record(main)?.map(|record| record.vbpk).unwrap_or_default();
        store.set_vbpk(main, &main_vbpk)?;
        if !moved_vbpk.is_empty() && moved_vbpk != main_vbpk {
            warn!(main, dropped = %moved_vbpk, "vbPK of transferred record dropped");
            outcome.details.push(format!(
                "vbPK '{moved_vbpk}' from transferred bPK dropped in favour of main contact's own one."
            ));
        }
    }

    info!(main, holder, changed = outcome.changed_attributes.len(), "bPK merge resolved");
    Ok(outcome)
}
