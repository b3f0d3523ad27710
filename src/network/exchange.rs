//! Peer genome exchange — truncation selection realized over the wire
//!
//! Every local slot issues exactly one operation: survivors send their
//! encoded genome to the worker owning their pair, culled slots post a
//! receive from it. All operations of a generation are joined once.

use super::comm::Communicator;
use super::protocol::{SlotInstruction, Tag};
use crate::error::{EvoError, Result};
use futures::future::{try_join_all, BoxFuture, FutureExt};
use log::debug;

/// Run one generation's exchange for the batch starting at `first_slot`.
///
/// `encode` is called for each sending slot with its local index. Returns, per
/// local slot, the genome bytes received (culled slots) or `None` (survivors).
pub async fn exchange_genomes<F>(
    comm: &Communicator,
    instructions: &[SlotInstruction],
    first_slot: usize,
    buffer_size: usize,
    mut encode: F,
) -> Result<Vec<Option<Vec<u8>>>>
where
    F: FnMut(usize) -> Result<Vec<u8>>,
{
    let batch_size = instructions.len();
    if batch_size == 0 {
        return Ok(Vec::new());
    }
    let owner = |slot: usize| slot / batch_size;

    let mut operations: Vec<BoxFuture<'static, Result<Option<Vec<u8>>>>> =
        Vec::with_capacity(batch_size);
    for (i, instruction) in instructions.iter().enumerate() {
        let slot = first_slot + i;
        let peer = owner(instruction.pair_slot);
        if peer >= comm.size() {
            return Err(EvoError::comm(format!(
                "slot {} paired with slot {} outside the population",
                slot, instruction.pair_slot
            )));
        }
        if instruction.sending {
            let payload = encode(i)?;
            operations.push(
                comm.isend(peer, Tag::Slot(slot), payload)
                    .map(|sent| sent.map(|_| None))
                    .boxed(),
            );
        } else {
            operations.push(
                comm.irecv(peer, Tag::Slot(instruction.pair_slot), buffer_size)
                    .map(|received| received.map(Some))
                    .boxed(),
            );
        }
    }

    let received = try_join_all(operations).await?;
    debug!(
        "rank {} exchanged {} genomes ({} received)",
        comm.rank(),
        batch_size,
        received.iter().filter(|r| r.is_some()).count()
    );
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::comm::local_group;
    use crate::network::protocol::plan_exchange;
    use crate::seed::{LineageMatrix, Ranking};

    #[tokio::test]
    async fn test_worst_half_receives_pair_genomes() {
        // P = 8 over 4 workers, each slot's "genome" is its own slot index repeated
        let population = 8;
        let workers = 4;
        let batch = population / workers;
        let fitness = [0.3, 0.8, 0.1, 0.6, 0.9, 0.2, 0.5, 0.4];
        let ranking = Ranking::from_keys(&fitness);
        let mut lineage = LineageMatrix::new(population);
        lineage.append_column(&[1; 8]);
        let plan = plan_exchange(&ranking, &lineage);

        let genome = |slot: usize| vec![slot as u8; 3 + slot];
        let max_size = (0..population).map(|s| genome(s).len()).max().unwrap();

        let tasks = local_group(workers).into_iter().map(|comm| {
            let plan = plan.clone();
            tokio::spawn(async move {
                let first = comm.rank() * batch;
                let local = &plan[first..first + batch];
                exchange_genomes(&comm, local, first, max_size, |i| Ok(genome(first + i))).await
            })
        });
        let results = try_join_all(tasks).await.unwrap();

        for (rank, result) in results.into_iter().enumerate() {
            let received = result.unwrap();
            for (i, bytes) in received.into_iter().enumerate() {
                let slot = rank * batch + i;
                if ranking.survives(slot) {
                    assert!(bytes.is_none());
                } else {
                    assert_eq!(bytes.unwrap(), genome(ranking.pair_of(slot)));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_undersized_buffer_fails() {
        let ranking = Ranking::from_keys(&[1.0, 0.0]);
        let mut lineage = LineageMatrix::new(2);
        lineage.append_column(&[5, 6]);
        let plan = plan_exchange(&ranking, &lineage);
        let comm = local_group(1).pop().unwrap();
        let result = exchange_genomes(&comm, &plan, 0, 2, |_| Ok(vec![0; 8])).await;
        assert!(result.is_err());
    }
}
