//! Per-participant host handle over the shared simulated network.
//!
//! One `SimHost` exists per participant and implements the full capability
//! bundle the core consumes. All state lives in the shared [`SimNet`]; the
//! handle only carries the participant's identity.

use crate::network::SimNet;
use granite_gpbft::{
    Chain, Clock, DecisionReceiver, HostError, MessageBuilder, Network, Signer, Verifier,
};
use granite_types::{
    ActorId, ECChain, Justification, NetworkName, PowerTable, PubKey,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

pub struct SimHost {
    id: ActorId,
    /// Local copy: `network_name()` returns a reference.
    network_name: NetworkName,
    shared: Rc<RefCell<SimNet>>,
}

impl SimHost {
    pub(crate) fn new(id: ActorId, shared: Rc<RefCell<SimNet>>) -> Self {
        let network_name = shared.borrow().network_name.clone();
        Self {
            id,
            network_name,
            shared,
        }
    }
}

impl Chain for SimHost {
    fn get_chain_for_instance(&mut self, instance: u64) -> Result<ECChain, HostError> {
        self.shared
            .borrow()
            .chains
            .get(&(self.id, instance))
            .cloned()
            .ok_or_else(|| HostError(format!("no chain registered for instance {instance}")))
    }

    fn get_committee_for_instance(
        &mut self,
        _instance: u64,
    ) -> Result<(PowerTable, Vec<u8>), HostError> {
        self.shared
            .borrow()
            .committee
            .clone()
            .ok_or_else(|| HostError("no committee registered".into()))
    }
}

impl Network for SimHost {
    fn network_name(&self) -> &NetworkName {
        &self.network_name
    }

    fn request_broadcast(&mut self, builder: MessageBuilder) -> Result<(), HostError> {
        let mut net = self.shared.borrow_mut();
        let inputs = builder.prepare_signing_inputs(&self.network_name);
        let (payload_sig, vrf) = inputs.sign(&net.signing, &builder.pub_key)?;
        let msg = builder.build(payload_sig, vrf);
        net.broadcast(self.id, msg);
        Ok(())
    }
}

impl Clock for SimHost {
    fn time(&self) -> Duration {
        self.shared.borrow().now
    }

    fn set_alarm(&mut self, at: Duration) {
        self.shared.borrow_mut().alarms.insert(self.id, at);
    }
}

impl Signer for SimHost {
    fn sign(&self, pub_key: &PubKey, msg: &[u8]) -> Result<Vec<u8>, HostError> {
        self.shared.borrow().signing.sign(pub_key, msg)
    }
}

impl Verifier for SimHost {
    fn verify(&self, pub_key: &PubKey, msg: &[u8], sig: &[u8]) -> Result<(), HostError> {
        self.shared.borrow().signing.verify(pub_key, msg, sig)
    }

    fn aggregate(&self, pub_keys: &[PubKey], sigs: &[Vec<u8>]) -> Result<Vec<u8>, HostError> {
        self.shared.borrow().signing.aggregate(pub_keys, sigs)
    }

    fn verify_aggregate(
        &self,
        payload: &[u8],
        agg_sig: &[u8],
        signers: &[PubKey],
    ) -> Result<(), HostError> {
        self.shared
            .borrow()
            .signing
            .verify_aggregate(payload, agg_sig, signers)
    }
}

impl DecisionReceiver for SimHost {
    fn receive_decision(&mut self, decision: &Justification) -> Duration {
        let mut net = self.shared.borrow_mut();
        let instance = decision.vote.instance;
        net.decisions
            .entry(self.id)
            .or_default()
            .push((instance, decision.clone()));
        net.now + net.config.ec_period
    }
}
