//! A single Granite consensus instance.
//!
//! The instance advances through QUALITY → (CONVERGE → PREPARE → COMMIT)* →
//! DECIDE → TERMINATED, driven by received votes and a single-timer alarm.
//! QUALITY, PREPARE, and COMMIT alarms are upper bounds (the phase may exit
//! earlier on quorum); the CONVERGE alarm is the sole exit trigger for that
//! phase. The COMMIT phase of every past round stays open: a late strong
//! quorum for a non-bottom value still causes a local decision in that round.
//!
//! All host effects flow through an injected `&mut impl Host`; the instance
//! holds no reference back to its participant.

use crate::converge::ConvergeState;
use crate::error::GpbftError;
use crate::host::{Host, MessageBuilder, Verifier};
use crate::quorum::{QuorumResult, QuorumState};
use granite_types::{
    ActorId, ECChain, GMessage, Justification, Payload, Phase, PowerTable,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-round phase state. State from prior rounds is kept to justify values
/// in subsequent rounds and to admit late decisions.
struct RoundState {
    converged: ConvergeState,
    prepared: QuorumState,
    committed: QuorumState,
}

impl RoundState {
    fn new(power_table: Arc<PowerTable>) -> Self {
        Self {
            converged: ConvergeState::new(),
            prepared: QuorumState::new(power_table.clone()),
            committed: QuorumState::new(power_table),
        }
    }
}

pub(crate) struct Instance {
    /// Id of the participant running this instance.
    participant_id: ActorId,
    instance_id: u64,
    /// The EC chain input to this instance.
    input: ECChain,
    /// The power table for the base chain, used for power in this instance.
    power_table: Arc<PowerTable>,
    /// The beacon value from the base chain, used for tickets.
    beacon: Vec<u8>,
    delta: Duration,
    delta_backoff_exponent: f64,
    /// Current round number.
    round: u64,
    /// Current phase in the round.
    phase: Phase,
    /// Time at which the current phase can or must end. For QUALITY,
    /// PREPARE, and COMMIT this is the latest time (the phase can end
    /// sooner); for CONVERGE it is the exact time.
    phase_timeout: Duration,
    /// This instance's proposal for the current round. Always a prefix of
    /// `input`; never bottom. Set after QUALITY; changes only at the end of
    /// a full round, or when swayed.
    proposal: ECChain,
    /// The value to transmit at the next phase; may be bottom.
    value: ECChain,
    /// Values acceptable as proposals: the base chain, all quality prefixes
    /// with strong quorum, and any value another participant could have
    /// decided.
    candidates: Vec<ECChain>,
    /// The final termination value, once decided.
    termination_value: Option<Justification>,
    /// Messages queued for synchronous processing. The message at the front
    /// stays in place while being processed, signalling an active drain.
    inbox: VecDeque<GMessage>,
    /// QUALITY phase vote state (round 0 only).
    quality: QuorumState,
    /// Per-round phase state.
    rounds: BTreeMap<u64, RoundState>,
    /// DECIDE vote state, independent of rounds.
    decision: QuorumState,
}

impl Instance {
    pub(crate) fn new(
        participant_id: ActorId,
        instance_id: u64,
        input: ECChain,
        power_table: Arc<PowerTable>,
        beacon: Vec<u8>,
        delta: Duration,
        delta_backoff_exponent: f64,
    ) -> Result<Self, GpbftError> {
        if input.is_zero() {
            return Err(GpbftError::ReceivedInternalError(
                "instance input is empty".into(),
            ));
        }
        let mut rounds = BTreeMap::new();
        rounds.insert(0, RoundState::new(power_table.clone()));
        Ok(Self {
            participant_id,
            instance_id,
            proposal: input.clone(),
            candidates: vec![input.base_chain()],
            input,
            quality: QuorumState::new(power_table.clone()),
            decision: QuorumState::new(power_table.clone()),
            power_table,
            beacon,
            delta,
            delta_backoff_exponent,
            round: 0,
            phase: Phase::Initial,
            phase_timeout: Duration::ZERO,
            value: ECChain::bottom(),
            termination_value: None,
            inbox: VecDeque::new(),
            rounds,
        })
    }

    pub(crate) fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub(crate) fn round(&self) -> u64 {
        self.round
    }

    pub(crate) fn termination_value(&self) -> Option<&Justification> {
        self.termination_value.as_ref()
    }

    pub(crate) fn terminated(&self) -> bool {
        self.phase == Phase::Terminated
    }

    /// Begins executing the instance by entering the QUALITY phase.
    pub(crate) fn start<H: Host>(&mut self, host: &mut H) -> Result<(), GpbftError> {
        self.begin_quality(host)
    }

    /// Receives a validated message. The caller must have validated the
    /// message against this instance's committee.
    pub(crate) fn receive<H: Host>(
        &mut self,
        host: &mut H,
        msg: GMessage,
    ) -> Result<(), GpbftError> {
        if self.terminated() {
            return Err(GpbftError::ReceivedInternalError(
                "message received after decision".into(),
            ));
        }
        if !self.inbox.is_empty() {
            return Err(GpbftError::ReceivedInternalError(
                "message received while already draining inbox".into(),
            ));
        }
        // The base check is late-bound: it needs this instance's input, so
        // it can't happen at the transport validator.
        if !(msg.vote.value.is_zero() || msg.vote.value.has_base(self.input.base())) {
            return Err(GpbftError::ValidationWrongBase);
        }

        self.inbox.push_back(msg);
        self.drain_inbox(host)
    }

    /// Receives an alarm fire: attempts to complete the current phase.
    pub(crate) fn receive_alarm<H: Host>(&mut self, host: &mut H) -> Result<(), GpbftError> {
        self.try_complete_phase(host)?;
        // A phase may have completed; re-process anything queued behind it.
        self.drain_inbox(host)
    }

    fn drain_inbox<H: Host>(&mut self, host: &mut H) -> Result<(), GpbftError> {
        while let Some(msg) = self.inbox.front() {
            // The message being processed stays at the front until after
            // processing, as the signal that a drain is in progress.
            let msg = msg.clone();
            self.receive_one(host, &msg)?;
            self.inbox.pop_front();
        }
        Ok(())
    }

    /// Processes a single validated message.
    fn receive_one<H: Host>(&mut self, host: &mut H, msg: &GMessage) -> Result<(), GpbftError> {
        if self.phase == Phase::Terminated {
            return Ok(());
        }

        match msg.vote.phase {
            Phase::Quality => {
                // Each prefix of the proposal counts as an independent vote.
                self.quality.receive_each_prefix(msg.sender, &msg.vote.value);
            }
            Phase::Converge => {
                let justification = require_justification(msg)?;
                self.round_state_mut(msg.vote.round).converged.receive(
                    msg.sender,
                    &msg.vote.value,
                    &msg.ticket,
                    justification,
                )?;
            }
            Phase::Prepare => {
                self.round_state_mut(msg.vote.round).prepared.receive(
                    msg.sender,
                    &msg.vote.value,
                    &msg.signature,
                );
            }
            Phase::Commit => {
                let round_state = self.round_state_mut(msg.vote.round);
                round_state
                    .committed
                    .receive(msg.sender, &msg.vote.value, &msg.signature);
                // Only justifications for COMMITs of non-bottom values need
                // storing: they can justify a CONVERGE in the next round.
                if !msg.vote.value.is_zero() {
                    let justification = require_justification(msg)?;
                    round_state
                        .committed
                        .receive_justification(&msg.vote.value, justification);
                }
            }
            Phase::Decide => {
                self.decision
                    .receive(msg.sender, &msg.vote.value, &msg.signature);
                if self.phase != Phase::Decide {
                    let justification = require_justification(msg)?.clone();
                    self.skip_to_decide(host, msg.vote.value.clone(), justification);
                }
                return self.try_decide(host);
            }
            Phase::Initial | Phase::Terminated => {
                warn!(instance = self.instance_id, ?msg, "unexpected message phase");
            }
        }

        // Every COMMIT phase stays open to new messages even after the
        // protocol moves to a later round; a late COMMIT can still force a
        // local decision in its own round.
        if msg.vote.phase == Phase::Commit && self.phase != Phase::Decide {
            self.try_commit(host, msg.vote.round)
        } else {
            self.try_complete_phase(host)
        }
    }

    /// Attempts to complete the current phase and round.
    fn try_complete_phase<H: Host>(&mut self, host: &mut H) -> Result<(), GpbftError> {
        match self.phase {
            Phase::Quality => self.try_quality(host),
            Phase::Converge => self.try_converge(host),
            Phase::Prepare => self.try_prepare(host),
            Phase::Commit => self.try_commit(host, self.round),
            Phase::Decide => self.try_decide(host),
            Phase::Terminated => Ok(()),
            Phase::Initial => Err(GpbftError::ReceivedInternalError(format!(
                "unexpected phase {}",
                self.phase
            ))),
        }
    }

    // ─── QUALITY ───

    fn begin_quality<H: Host>(&mut self, host: &mut H) -> Result<(), GpbftError> {
        if self.phase != Phase::Initial {
            return Err(GpbftError::ReceivedInternalError(format!(
                "cannot transition from {} to {}",
                self.phase,
                Phase::Quality
            )));
        }
        // Broadcast the input value and wait up to 2Δ to hear from others.
        self.phase = Phase::Quality;
        self.phase_timeout = self.alarm_after_synchrony(host);
        self.broadcast(host, self.round, Phase::Quality, self.input.clone(), false, None);
        Ok(())
    }

    fn try_quality<H: Host>(&mut self, host: &mut H) -> Result<(), GpbftError> {
        debug_assert_eq!(self.phase, Phase::Quality);
        // Wait either for a strong quorum agreeing on our proposal, or for
        // the timeout.
        let found_quorum = self.quality.has_strong_quorum_for(&self.proposal.key());
        let timeout_expired = host.time() >= self.phase_timeout;

        if !found_quorum && timeout_expired {
            // Adopt the longest prefix of our proposal with a strong quorum
            // of support, falling back to the base chain.
            let strong_quora = self.quality.list_strong_quorum_values();
            self.proposal = find_first_prefix_of(&self.proposal, &strong_quora);
        }

        if found_quorum || timeout_expired {
            // Add non-base prefixes of the chosen proposal to candidates
            // (the base chain is already there).
            for l in 1..self.proposal.len() {
                self.candidates.push(self.proposal.prefix(l));
            }
            self.value = self.proposal.clone();
            debug!(
                participant = self.participant_id,
                instance = self.instance_id,
                proposal = %self.proposal,
                "adopting proposal after QUALITY"
            );
            self.begin_prepare(host, None);
        }
        Ok(())
    }

    // ─── CONVERGE ───

    fn begin_converge<H: Host>(&mut self, host: &mut H) {
        self.phase = Phase::Converge;
        self.phase_timeout = self.alarm_after_synchrony(host);

        // The proposal was set at the end of the previous COMMIT phase to a
        // value some participant sent a (justified) COMMIT for, if any.
        // Otherwise there was a strong quorum for bottom instead.
        let prev_round = self.round - 1;
        let bottom_key = ECChain::bottom().key();
        let justification = {
            let committed = &self
                .rounds
                .get(&prev_round)
                .expect("previous round state missing at CONVERGE")
                .committed;
            if let Some(quorum) = committed.find_strong_quorum_for(&bottom_key) {
                self.build_justification(host, &quorum, prev_round, Phase::Commit, ECChain::bottom())
            } else {
                committed
                    .justification_for(&self.proposal.key())
                    .unwrap_or_else(|| panic!("beginConverge called but no justification for proposal"))
                    .clone()
            }
        };

        self.broadcast(
            host,
            self.round,
            Phase::Converge,
            self.proposal.clone(),
            true,
            Some(justification),
        );
    }

    fn try_converge<H: Host>(&mut self, host: &mut H) -> Result<(), GpbftError> {
        debug_assert_eq!(self.phase, Phase::Converge);
        // The CONVERGE timeout is the sole exit; no early exit on quorum.
        if host.time() < self.phase_timeout {
            return Ok(());
        }

        let prev_round = self.round - 1;
        let bottom_key = ECChain::bottom().key();
        let possible_decision_last_round = !self
            .rounds
            .get(&prev_round)
            .expect("previous round state missing at CONVERGE")
            .committed
            .has_strong_quorum_for(&bottom_key);

        self.round_state_mut(self.round);
        let converged = &self.rounds.get(&self.round).unwrap().converged;
        let Some(winner) = converged.find_max_ticket_proposal(&self.power_table) else {
            return Err(GpbftError::ReceivedInternalError(
                "no values at CONVERGE".into(),
            ));
        };
        let winner = winner.clone();

        // If the winner is not a candidate but could have been decided by
        // another participant in the last round, sway to consider it one.
        if !self.is_candidate(&winner.chain)
            && winner.justification.vote.phase == Phase::Prepare
            && possible_decision_last_round
        {
            warn!(
                participant = self.participant_id,
                instance = self.instance_id,
                round = self.round,
                from = %self.proposal,
                to = %winner.chain,
                "swaying by CONVERGE"
            );
            self.candidates.push(winner.chain.clone());
        }

        let mut justification = winner.justification.clone();
        if self.is_candidate(&winner.chain) {
            self.proposal = winner.chain;
            debug!(
                participant = self.participant_id,
                instance = self.instance_id,
                proposal = %self.proposal,
                "adopting proposal after CONVERGE"
            );
        } else {
            // Preserve our own proposal; some participant proposed it with a
            // justification we can reuse.
            let fallback = self
                .rounds
                .get(&self.round)
                .unwrap()
                .converged
                .find_proposal_for(&self.proposal)
                .unwrap_or_else(|| panic!("own proposal not found at CONVERGE"));
            justification = fallback.justification.clone();
        }

        self.value = self.proposal.clone();
        self.begin_prepare(host, Some(justification));
        Ok(())
    }

    // ─── PREPARE ───

    fn begin_prepare<H: Host>(&mut self, host: &mut H, justification: Option<Justification>) {
        self.phase = Phase::Prepare;
        self.phase_timeout = self.alarm_after_synchrony(host);
        self.broadcast(
            host,
            self.round,
            Phase::Prepare,
            self.value.clone(),
            false,
            justification,
        );
    }

    fn try_prepare<H: Host>(&mut self, host: &mut H) -> Result<(), GpbftError> {
        debug_assert_eq!(self.phase, Phase::Prepare);
        self.round_state_mut(self.round);
        let prepared = &self.rounds.get(&self.round).unwrap().prepared;

        let found_quorum = prepared.has_strong_quorum_for(&self.proposal.key());
        let timed_out =
            host.time() >= self.phase_timeout && prepared.received_from_strong_quorum();

        if found_quorum {
            self.value = self.proposal.clone();
        } else if timed_out {
            self.value = ECChain::bottom();
        }

        if found_quorum || timed_out {
            self.begin_commit(host);
        }
        Ok(())
    }

    // ─── COMMIT ───

    fn begin_commit<H: Host>(&mut self, host: &mut H) {
        self.phase = Phase::Commit;
        self.phase_timeout = self.alarm_after_synchrony(host);

        // PREPARE exited either with value == proposal under a strong
        // quorum, or with value == bottom. Committing bottom needs no
        // justification.
        let justification = if self.value.is_zero() {
            None
        } else {
            let quorum = self
                .rounds
                .get(&self.round)
                .expect("round state missing at COMMIT")
                .prepared
                .find_strong_quorum_for(&self.value.key())
                .unwrap_or_else(|| panic!("beginCommit with no strong quorum for non-bottom value"));
            Some(self.build_justification(
                host,
                &quorum,
                self.round,
                Phase::Prepare,
                self.value.clone(),
            ))
        };

        self.broadcast(
            host,
            self.round,
            Phase::Commit,
            self.value.clone(),
            false,
            justification,
        );
    }

    fn try_commit<H: Host>(&mut self, host: &mut H, round: u64) -> Result<(), GpbftError> {
        // Unlike other phases, COMMIT stays open after a quorum is reached
        // and the protocol moves on; a late COMMIT can still cause a
        // decision in this round, so there is no check on the current phase.
        self.round_state_mut(round);
        let committed = &self.rounds.get(&round).unwrap().committed;
        let quorum_value = committed.find_strong_quorum_value();
        let timed_out =
            host.time() >= self.phase_timeout && committed.received_from_strong_quorum();

        match quorum_value {
            Some(value) if !value.is_zero() => {
                // A participant may be forced to decide a value that isn't
                // its preferred chain; it is accepting the decision, not
                // influencing it against its interest.
                self.value = value;
                self.begin_decide(host, round);
            }
            quorum_value => {
                if self.round == round && self.phase == Phase::Commit && timed_out {
                    if quorum_value.is_some() {
                        // Strong quorum for bottom: carry the proposal forward.
                    } else {
                        // No strong quorum for bottom means a COMMIT for some
                        // other value exists, and only one such value can be
                        // PREPARE-justified. Another participant may have seen
                        // a strong quorum for it, so sway to consider it.
                        let seen = self
                            .rounds
                            .get(&round)
                            .unwrap()
                            .committed
                            .list_all_values()
                            .find(|v| !v.is_zero())
                            .cloned();
                        if let Some(value) = seen {
                            if !self.is_candidate(&value) {
                                warn!(
                                    participant = self.participant_id,
                                    instance = self.instance_id,
                                    round,
                                    from = %self.proposal,
                                    to = %value,
                                    "swaying by COMMIT"
                                );
                                self.candidates.push(value.clone());
                            }
                            if value != self.proposal {
                                self.proposal = value;
                                debug!(
                                    participant = self.participant_id,
                                    instance = self.instance_id,
                                    proposal = %self.proposal,
                                    "adopting proposal after COMMIT"
                                );
                            }
                        }
                    }
                    self.begin_next_round(host);
                }
            }
        }
        Ok(())
    }

    fn begin_next_round<H: Host>(&mut self, host: &mut H) {
        self.round += 1;
        debug!(
            participant = self.participant_id,
            instance = self.instance_id,
            round = self.round,
            proposal = %self.proposal,
            "moving to next round"
        );
        self.begin_converge(host);
    }

    // ─── DECIDE ───

    fn begin_decide<H: Host>(&mut self, host: &mut H, round: u64) {
        self.phase = Phase::Decide;
        let quorum = self
            .rounds
            .get(&round)
            .expect("round state missing at DECIDE")
            .committed
            .find_strong_quorum_for(&self.value.key())
            .unwrap_or_else(|| panic!("beginDecide with no strong quorum for value"));
        let justification =
            self.build_justification(host, &quorum, round, Phase::Commit, self.value.clone());

        // DECIDE messages always specify round 0. Out-of-order delivery can
        // make nodes decide in different rounds (for the same value), and
        // each node sends a single DECIDE, so votes must match to aggregate.
        self.broadcast(host, 0, Phase::Decide, self.value.clone(), false, Some(justification));
    }

    /// Skips immediately to DECIDE without a strong quorum of COMMITs in
    /// any round. The justification (from a received DECIDE message) must
    /// justify the value being decided.
    fn skip_to_decide<H: Host>(
        &mut self,
        host: &mut H,
        value: ECChain,
        justification: Justification,
    ) {
        self.phase = Phase::Decide;
        self.proposal = value;
        self.value = self.proposal.clone();
        self.broadcast(host, 0, Phase::Decide, self.value.clone(), false, Some(justification));
    }

    fn try_decide<H: Host>(&mut self, host: &mut H) -> Result<(), GpbftError> {
        if let Some(quorum_value) = self.decision.find_strong_quorum_value() {
            let quorum = self
                .decision
                .find_strong_quorum_for(&quorum_value.key())
                .unwrap_or_else(|| panic!("tryDecide with no strong quorum for value"));
            let decision =
                self.build_justification(host, &quorum, 0, Phase::Decide, quorum_value);
            self.terminate(decision);
        }
        Ok(())
    }

    fn terminate(&mut self, decision: Justification) {
        info!(
            participant = self.participant_id,
            instance = self.instance_id,
            round = self.round,
            value = %decision.vote.value,
            "instance terminated"
        );
        self.phase = Phase::Terminated;
        self.value = decision.vote.value.clone();
        self.termination_value = Some(decision);
    }

    // ─── Helpers ───

    fn round_state_mut(&mut self, round: u64) -> &mut RoundState {
        self.rounds
            .entry(round)
            .or_insert_with(|| RoundState::new(self.power_table.clone()))
    }

    /// Whether a chain is acceptable as a proposal for this instance.
    fn is_candidate(&self, chain: &ECChain) -> bool {
        self.candidates.iter().any(|c| c == chain)
    }

    fn broadcast<H: Host>(
        &mut self,
        host: &mut H,
        round: u64,
        phase: Phase,
        value: ECChain,
        with_ticket: bool,
        justification: Option<Justification>,
    ) {
        // A participant outside the power table observes without voting.
        let Some((_, pub_key)) = self.power_table.get(self.participant_id) else {
            debug!(
                participant = self.participant_id,
                instance = self.instance_id,
                "not in power table, skipping broadcast"
            );
            return;
        };
        let builder = MessageBuilder {
            sender: self.participant_id,
            pub_key: pub_key.clone(),
            payload: Payload::new(self.instance_id, round, phase, value),
            beacon_for_ticket: with_ticket.then(|| self.beacon.clone()),
            justification,
        };
        if let Err(e) = host.request_broadcast(builder) {
            warn!(
                participant = self.participant_id,
                instance = self.instance_id,
                error = %e,
                "failed to broadcast message"
            );
        }
    }

    /// Sets an alarm a synchrony delay from now. The delay grows
    /// exponentially with the round. Returns the absolute fire time.
    fn alarm_after_synchrony<H: Host>(&self, host: &mut H) -> Duration {
        let delta = self
            .delta
            .mul_f64(self.delta_backoff_exponent.powi(self.round as i32));
        let timeout = host.time() + delta * 2;
        host.set_alarm(timeout);
        timeout
    }

    /// Builds a justification for a value from a quorum result.
    fn build_justification<V: Verifier>(
        &self,
        verifier: &V,
        quorum: &QuorumResult,
        round: u64,
        phase: Phase,
        value: ECChain,
    ) -> Justification {
        let signature = quorum
            .aggregate(verifier)
            .unwrap_or_else(|e| panic!("aggregating signatures for phase {phase}: {e}"));
        Justification {
            vote: Payload::new(self.instance_id, round, phase, value),
            signers: quorum.signers_bitfield(),
            signature,
        }
    }
}

fn require_justification(msg: &GMessage) -> Result<&Justification, GpbftError> {
    msg.justification.as_ref().ok_or_else(|| {
        GpbftError::ReceivedInternalError(format!(
            "validated {} message without justification",
            msg.vote.phase
        ))
    })
}

/// Returns the first candidate that is a prefix of the preferred chain, or
/// the base of preferred if none is.
fn find_first_prefix_of(preferred: &ECChain, candidates: &[ECChain]) -> ECChain {
    candidates
        .iter()
        .find(|c| preferred.has_prefix(c))
        .cloned()
        .unwrap_or_else(|| preferred.base_chain())
}
