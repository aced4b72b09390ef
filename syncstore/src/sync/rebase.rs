//! Replaying local mutations on top of a new snapshot.

use snafu::{OptionExt, ensure};
use syncstore_base::Hash;
use tracing::{error, instrument};

use super::{NotLocalSnafu, SyncError};
use crate::{
    dag,
    db::{self, Commit, FormatVersion, InconsistentMutationIdSnafu, commit_from_hash},
    transaction::{MutatorRegistry, TransactionEnvironment, TransactionReason, WriteTransaction},
};

/// Replays the local commit `mutation` on top of `basis` and points
/// `head_name` at the result.
///
/// The replayed commit must get the same mutation id it had originally.
/// Unknown mutators and mutators failing during replay are logged; the
/// commit is still written so that the mutation is not lost.
#[instrument(skip_all, fields(mutation = %mutation.hash().fmt_short(), basis = %basis.fmt_short()))]
#[allow(clippy::too_many_arguments)]
pub fn rebase_mutation(
    mutation: &Commit,
    dag_write: &mut dag::Write,
    basis: Hash,
    head_name: &str,
    mutators: &MutatorRegistry,
    environment: TransactionEnvironment,
    client_id: &str,
    format_version: FormatVersion,
) -> Result<Hash, SyncError> {
    let parts = mutation
        .meta()
        .local_parts()
        .context(NotLocalSnafu {
            hash: mutation.hash(),
        })?;
    let mutation_client_id = parts.client_id.unwrap_or(client_id);
    let basis_commit = commit_from_hash(&basis, &*dag_write)?;
    let next_mutation_id = basis_commit.next_mutation_id(mutation_client_id, &*dag_write)?;
    ensure!(
        next_mutation_id == parts.mutation_id,
        InconsistentMutationIdSnafu {
            client_id: mutation_client_id,
            expected: next_mutation_id,
            actual: parts.mutation_id,
        }
    );

    let mut write = db::Write::new_local(
        basis,
        parts.mutator_name,
        parts.mutator_args.clone(),
        Some(mutation.hash()),
        dag_write,
        parts.timestamp,
        mutation_client_id,
        format_version,
    )?;
    match mutators.get(parts.mutator_name) {
        Some(mutator) => {
            let mut tx = WriteTransaction::new(
                &mut write,
                environment,
                TransactionReason::Rebase,
                parts.mutation_id,
                mutation_client_id,
            );
            if let Err(err) = mutator.mutate(&mut tx, parts.mutator_args) {
                error!(name = parts.mutator_name, "Mutator failed during rebase: {err}");
            }
        }
        None => error!("Cannot rebase unknown mutator {}", parts.mutator_name),
    }
    Ok(write.commit(head_name)?)
}
