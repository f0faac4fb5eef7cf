//! Test support: a transparent signing scheme and a recording mock host.

use crate::error::HostError;
use crate::host::{
    Chain, Clock, DecisionReceiver, MessageBuilder, Network, Signer, Verifier,
};
use granite_types::{ECChain, Justification, NetworkName, PowerTable, PubKey};
use std::time::Duration;

/// Transparent scheme: a signature is the public key followed by the
/// message; an aggregate is the length-prefixed concatenation of the
/// individual signatures. Deterministic and trivially checkable.
pub(crate) struct TestScheme;

impl TestScheme {
    pub(crate) fn sig(pub_key: &PubKey, msg: &[u8]) -> Vec<u8> {
        let mut out = vec![pub_key.0.len() as u8];
        out.extend_from_slice(&pub_key.0);
        out.extend_from_slice(msg);
        out
    }
}

impl Signer for TestScheme {
    fn sign(&self, pub_key: &PubKey, msg: &[u8]) -> Result<Vec<u8>, HostError> {
        Ok(Self::sig(pub_key, msg))
    }
}

impl Verifier for TestScheme {
    fn verify(&self, pub_key: &PubKey, msg: &[u8], sig: &[u8]) -> Result<(), HostError> {
        if sig == Self::sig(pub_key, msg) {
            Ok(())
        } else {
            Err(HostError("signature mismatch".into()))
        }
    }

    fn aggregate(&self, pub_keys: &[PubKey], sigs: &[Vec<u8>]) -> Result<Vec<u8>, HostError> {
        if pub_keys.len() != sigs.len() {
            return Err(HostError("length mismatch".into()));
        }
        let mut out = Vec::new();
        for sig in sigs {
            out.extend_from_slice(&(sig.len() as u32).to_be_bytes());
            out.extend_from_slice(sig);
        }
        Ok(out)
    }

    fn verify_aggregate(
        &self,
        payload: &[u8],
        agg_sig: &[u8],
        signers: &[PubKey],
    ) -> Result<(), HostError> {
        let sigs: Vec<Vec<u8>> = signers.iter().map(|pk| Self::sig(pk, payload)).collect();
        let expected = self.aggregate(signers, &sigs)?;
        if agg_sig == expected {
            Ok(())
        } else {
            Err(HostError("aggregate mismatch".into()))
        }
    }
}

/// Host that records broadcasts and alarms, with a manually advanced clock.
pub(crate) struct MockHost {
    pub now: Duration,
    pub alarm: Option<Duration>,
    pub broadcasts: Vec<MessageBuilder>,
    pub decisions: Vec<Justification>,
    network_name: NetworkName,
}

impl MockHost {
    pub(crate) fn new() -> Self {
        Self {
            now: Duration::ZERO,
            alarm: None,
            broadcasts: Vec::new(),
            decisions: Vec::new(),
            network_name: NetworkName::from("granite-test"),
        }
    }

    /// Advances the clock to the pending alarm and clears it.
    pub(crate) fn fire_alarm(&mut self) -> Duration {
        let at = self.alarm.take().expect("no alarm pending");
        self.now = self.now.max(at);
        at
    }
}

impl Chain for MockHost {
    fn get_chain_for_instance(&mut self, _instance: u64) -> Result<ECChain, HostError> {
        Err(HostError("no chain in mock host".into()))
    }

    fn get_committee_for_instance(
        &mut self,
        _instance: u64,
    ) -> Result<(PowerTable, Vec<u8>), HostError> {
        Err(HostError("no committee in mock host".into()))
    }
}

impl Network for MockHost {
    fn network_name(&self) -> &NetworkName {
        &self.network_name
    }

    fn request_broadcast(&mut self, builder: MessageBuilder) -> Result<(), HostError> {
        self.broadcasts.push(builder);
        Ok(())
    }
}

impl Clock for MockHost {
    fn time(&self) -> Duration {
        self.now
    }

    fn set_alarm(&mut self, at: Duration) {
        self.alarm = Some(at);
    }
}

impl Signer for MockHost {
    fn sign(&self, pub_key: &PubKey, msg: &[u8]) -> Result<Vec<u8>, HostError> {
        TestScheme.sign(pub_key, msg)
    }
}

impl Verifier for MockHost {
    fn verify(&self, pub_key: &PubKey, msg: &[u8], sig: &[u8]) -> Result<(), HostError> {
        TestScheme.verify(pub_key, msg, sig)
    }

    fn aggregate(&self, pub_keys: &[PubKey], sigs: &[Vec<u8>]) -> Result<Vec<u8>, HostError> {
        TestScheme.aggregate(pub_keys, sigs)
    }

    fn verify_aggregate(
        &self,
        payload: &[u8],
        agg_sig: &[u8],
        signers: &[PubKey],
    ) -> Result<(), HostError> {
        TestScheme.verify_aggregate(payload, agg_sig, signers)
    }
}

impl DecisionReceiver for MockHost {
    fn receive_decision(&mut self, decision: &Justification) -> Duration {
        self.decisions.push(decision.clone());
        self.now + Duration::from_millis(1)
    }
}
