//! End-to-end tests with honest participants.
//!
//! These run entirely synchronously against the deterministic simulation:
//! same configuration and seed, same run. Each test asserts both the
//! expected decision and the soundness of its justification.

use granite_simulation::{NetworkConfig, SimBuilder, SimRunner};
use granite_types::test_utils::test_chain;
use granite_types::{ActorId, ECChain};
use std::time::Duration;
use tracing_test::traced_test;

const MAX_TIME: Duration = Duration::from_secs(60);

/// [base, A]
fn chain_a() -> ECChain {
    test_chain(&[(0, 0), (1, 1)])
}

fn run_to_decision(mut sim: SimRunner, instance: u64) -> SimRunner {
    sim.start();
    assert!(
        sim.run_until(MAX_TIME, |s| s.all_decided(instance)),
        "participants failed to decide instance {instance}"
    );
    sim
}

/// Asserts every participant decided `expected` for the instance, with a
/// sound justification, and returns the decisions' termination rounds.
fn assert_decided(sim: &SimRunner, instance: u64, expected: &ECChain) {
    for id in sim.participant_ids() {
        let decision = sim
            .decision(id, instance)
            .unwrap_or_else(|| panic!("participant {id} did not decide instance {instance}"));
        assert_eq!(
            &decision.vote.value, expected,
            "participant {id} decided {} instead of {expected}",
            decision.vote.value
        );
        sim.check_decision_soundness(&decision)
            .unwrap_or_else(|e| panic!("unsound decision from participant {id}: {e}"));
    }
}

#[traced_test]
#[test]
fn singleton_decides_own_proposal() {
    let sim = SimBuilder::new()
        .with_participants(&[1])
        .with_chain(0, chain_a())
        .build();
    let sim = run_to_decision(sim, 0);

    assert_decided(&sim, 0, &chain_a());

    let decision = sim.decision(0, 0).unwrap();
    let signers: Vec<u64> = decision.signers.iter().map(|b| b as u64).collect();
    assert_eq!(signers, vec![0]);

    // Terminated in round 0.
    let (_, round) = sim.participant(0).last_termination().unwrap();
    assert_eq!(*round, 0);
}

#[traced_test]
#[test]
fn synchronous_pair_agrees_on_shared_chain() {
    let sim = SimBuilder::new()
        .with_participants(&[1, 1])
        .with_chain(0, chain_a())
        .build();
    let sim = run_to_decision(sim, 0);

    assert_decided(&sim, 0, &chain_a());
    for id in sim.participant_ids() {
        let (_, round) = sim.participant(id).last_termination().unwrap();
        assert_eq!(*round, 0, "participant {id} needed extra rounds");
    }
}

#[traced_test]
#[test]
fn disagreeing_pair_decides_common_base() {
    let sim = SimBuilder::new()
        .with_participants(&[1, 1])
        .with_chain_for(0, 0, test_chain(&[(0, 0), (1, 1)]))
        .with_chain_for(1, 0, test_chain(&[(0, 0), (1, 2)]))
        .build();
    let sim = run_to_decision(sim, 0);

    // The longest common prefix is the base alone.
    assert_decided(&sim, 0, &test_chain(&[(0, 0)]));
}

#[traced_test]
#[test]
fn three_way_split_decides_base() {
    let mut builder = SimBuilder::new().with_participants(&[1, 1, 1]);
    for node in 0..3u64 {
        builder = builder.with_chain_for(
            node as ActorId,
            0,
            test_chain(&[(0, 0), (1, 1 + node as u8)]),
        );
    }
    let sim = run_to_decision(builder.build(), 0);

    assert_decided(&sim, 0, &test_chain(&[(0, 0)]));
}

#[traced_test]
#[test]
fn four_participants_decide_longest_common_prefix() {
    // Inputs [base, X, A], [base, X, B], [base, X, C], [base, X, D].
    let mut builder = SimBuilder::new().with_participants(&[1, 1, 1, 1]);
    for node in 0..4u64 {
        builder = builder.with_chain_for(
            node as ActorId,
            0,
            test_chain(&[(0, 0), (1, 1), (2, 10 + node as u8)]),
        );
    }
    let sim = run_to_decision(builder.build(), 0);

    assert_decided(&sim, 0, &test_chain(&[(0, 0), (1, 1)]));
}

#[traced_test]
#[test]
fn unequal_power_still_converges() {
    // No single node is a strong quorum (3·3 < 2·7); any two are.
    let sim = SimBuilder::new()
        .with_participants(&[3, 2, 2])
        .with_chain(0, chain_a())
        .build();
    let sim = run_to_decision(sim, 0);
    assert_decided(&sim, 0, &chain_a());
}

#[test]
fn higher_latency_still_decides() {
    let sim = SimBuilder::new()
        .with_participants(&[1, 1, 1])
        .with_network(NetworkConfig {
            latency_mean: Duration::from_millis(40),
            jitter_fraction: 0.5,
            seed: 7,
            ..NetworkConfig::default()
        })
        .with_chain(0, chain_a())
        .build();
    let sim = run_to_decision(sim, 0);
    assert_decided(&sim, 0, &chain_a());
}
