//! Peer-to-peer genome exchange driven through real adapters

use evoseed_core::agent::{build_adapter, LinearPolicy};
use evoseed_core::network::{exchange_genomes, local_group, plan_exchange};
use evoseed_core::{LineageMatrix, Ranking, RunConfig};
use futures::future::try_join_all;

#[tokio::test]
async fn test_worst_half_holds_pair_genome_after_exchange() {
    let population = 8;
    let workers = 4;
    let batch = population / workers;
    let config = RunConfig::new("sphere", "linear", population, 2);
    let adapter = build_adapter::<LinearPolicy>(&config, 0).unwrap();

    // generation 0: one distinct seed per slot
    let seeds: Vec<u32> = (0..population as u32).map(|s| 1000 + s).collect();
    let genomes: Vec<_> = seeds.iter().map(|&s| adapter.build(&[s]).unwrap()).collect();
    let fitness: Vec<f64> = genomes
        .iter()
        .map(|g| adapter.evaluate(g, 0).unwrap())
        .collect();
    let encoded: Vec<Vec<u8>> = genomes.iter().map(|g| adapter.serialize(g).unwrap()).collect();
    let buffer_size = encoded.iter().map(Vec::len).max().unwrap();

    let ranking = Ranking::from_keys(&fitness);
    let mut lineage = LineageMatrix::new(population);
    lineage.append_column(&seeds);
    lineage.append_column(&[7; 8]);
    let plan = plan_exchange(&ranking, &lineage);

    let tasks = local_group(workers).into_iter().map(|comm| {
        let plan = plan.clone();
        let encoded = encoded.clone();
        tokio::spawn(async move {
            let first = comm.rank() * batch;
            exchange_genomes(&comm, &plan[first..first + batch], first, buffer_size, |i| {
                Ok(encoded[first + i].clone())
            })
            .await
        })
    });
    let received: Vec<_> = try_join_all(tasks)
        .await
        .unwrap()
        .into_iter()
        .map(Result::unwrap)
        .flatten()
        .collect();

    for (slot, incoming) in received.into_iter().enumerate() {
        match incoming {
            Some(bytes) => {
                assert!(!ranking.survives(slot));
                let genome = adapter.deserialize(&bytes).unwrap();
                assert_eq!(genome, genomes[ranking.pair_of(slot)]);
            }
            None => assert!(ranking.survives(slot)),
        }
    }
}
