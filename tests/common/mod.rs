//! Shared integration harness: one wallet, two key-share nodes, and the two
//! client participants driven locally against the server participant.

#![allow(dead_code)]

use async_trait::async_trait;
use frost_ed25519 as frost;
use rand::rngs::OsRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use tss_custody::primitives::{
    EcdsaPrimitives, EcdsaProtocol, InboundMessage, PresignSeed, SignSeed, StepInput,
};
use tss_custody::protocol::consumed_rounds;
use tss_custody::storage::WalletStore;
use tss_custody::{
    Curve, CustodyCoordinator, EcdsaOrchestrator, Ed25519ShareData, EddsaOrchestrator, KeyShareNode,
    MasterKey, MemoryStore, NodeClient, NodeError, ParticipantId, PeerMessage, RoundRequest,
    RoundResponse, SimulatedEcdsa, Wallet,
};

pub const CUSTOMER: &str = "customer-1";
pub const WALLET: &str = "wallet-1";
pub const SERVER: ParticipantId = ParticipantId(2);
pub const CLIENTS: [ParticipantId; 2] = [ParticipantId(0), ParticipantId(1)];
pub const SECP_PUBLIC_KEY: &str =
    "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

/// How a stub node answers
#[derive(Debug, Clone)]
pub enum NodeBehavior {
    Holds,
    Missing,
    Fails(NodeError),
    Hangs,
}

/// Node client answering from a fixed table, keyed by node name
#[derive(Default)]
pub struct StaticNodeClient {
    behaviors: Mutex<HashMap<String, NodeBehavior>>,
}

impl StaticNodeClient {
    pub fn set(&self, name: &str, behavior: NodeBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(name.to_string(), behavior);
    }

    fn behavior(&self, node: &KeyShareNode) -> NodeBehavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(&node.name)
            .cloned()
            .unwrap_or(NodeBehavior::Holds)
    }
}

#[async_trait]
impl NodeClient for StaticNodeClient {
    async fn health(&self, node: &KeyShareNode) -> Result<(), NodeError> {
        match self.behavior(node) {
            NodeBehavior::Holds | NodeBehavior::Missing => Ok(()),
            NodeBehavior::Fails(e) => Err(e),
            NodeBehavior::Hangs => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        }
    }

    async fn key_share_exists(
        &self,
        node: &KeyShareNode,
        _identity: &str,
        _public_key: &str,
    ) -> Result<bool, NodeError> {
        match self.behavior(node) {
            NodeBehavior::Holds => Ok(true),
            NodeBehavior::Missing => Ok(false),
            NodeBehavior::Fails(e) => Err(e),
            NodeBehavior::Hangs => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(true)
            }
        }
    }
}

/// Client-side FROST key material for the dealer-split Ed25519 key
pub struct FrostClients {
    pub key_packages: BTreeMap<frost::Identifier, frost::keys::KeyPackage>,
    pub public_key_package: frost::keys::PublicKeyPackage,
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub nodes: Arc<StaticNodeClient>,
    pub node_ids: Vec<Uuid>,
    pub master_key: MasterKey,
    pub custody: Arc<CustodyCoordinator>,
    pub ecdsa: EcdsaOrchestrator,
    pub eddsa: EddsaOrchestrator,
    pub frost: FrostClients,
    pub ed25519_public_key: String,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_wallet(&Wallet::new(WALLET, CUSTOMER))
            .await
            .unwrap();

        let nodes = Arc::new(StaticNodeClient::default());
        let master_key = MasterKey::generate();
        let custody = Arc::new(CustodyCoordinator::new(
            store.clone(),
            nodes.clone(),
            master_key.clone(),
            Duration::from_millis(200),
        ));

        let mut node_ids = Vec::new();
        for name in ["node-1", "node-2"] {
            let node = custody
                .register_node(name, &format!("https://{}.example.com", name))
                .await
                .unwrap();
            node_ids.push(node.id);
        }

        custody
            .store_share(WALLET, Curve::Secp256k1, &[7u8; 32], SECP_PUBLIC_KEY, &node_ids)
            .await
            .unwrap();

        let (shares, public_key_package) = frost::keys::generate_with_dealer(
            3,
            2,
            frost::keys::IdentifierList::Default,
            &mut OsRng,
        )
        .unwrap();
        let mut key_packages: BTreeMap<frost::Identifier, frost::keys::KeyPackage> = shares
            .into_iter()
            .map(|(id, share)| (id, frost::keys::KeyPackage::try_from(share).unwrap()))
            .collect();

        let server_id = frost::Identifier::try_from(3u16).unwrap();
        let server_package = key_packages.remove(&server_id).unwrap();
        let share_data = Ed25519ShareData::from_packages(&server_package, &public_key_package).unwrap();
        let ed25519_public_key = share_data.group_public_key().unwrap();
        custody
            .store_share(
                WALLET,
                Curve::Ed25519,
                &share_data.to_bytes().unwrap(),
                &ed25519_public_key,
                &node_ids,
            )
            .await
            .unwrap();

        let ecdsa = EcdsaOrchestrator::new(
            store.clone(),
            custody.clone(),
            Arc::new(SimulatedEcdsa::new()),
            SERVER,
            &CLIENTS,
        );
        let eddsa = EddsaOrchestrator::new(store.clone(), custody.clone());

        Self {
            store,
            nodes,
            node_ids,
            master_key,
            custody,
            ecdsa,
            eddsa,
            frost: FrostClients {
                key_packages,
                public_key_package,
            },
            ed25519_public_key,
        }
    }

    pub fn round_request(
        &self,
        session_id: Uuid,
        step: u8,
        messages: Vec<PeerMessage>,
        message_hash: Option<String>,
    ) -> RoundRequest {
        RoundRequest {
            session_id,
            customer_id: CUSTOMER.to_string(),
            step,
            messages,
            message_hash,
        }
    }

    pub async fn server_step(
        &self,
        protocol: EcdsaProtocol,
        request: RoundRequest,
    ) -> tss_custody::Result<RoundResponse> {
        match protocol {
            EcdsaProtocol::Triples => self.ecdsa.triples(request).await,
            EcdsaProtocol::Presign => self.ecdsa.presign(request).await,
            EcdsaProtocol::Sign => self.ecdsa.sign(request).await,
        }
    }
}

/// Participants P0 and P1 running the simulated primitive locally
pub struct EcdsaClients {
    primitive: SimulatedEcdsa,
    states: HashMap<ParticipantId, Vec<u8>>,
    /// Every message sent so far, by anyone
    pub pool: Vec<PeerMessage>,
    /// Private outputs per (participant, protocol)
    pub outputs: HashMap<(ParticipantId, EcdsaProtocol), Vec<u8>>,
    pub public_outputs: HashMap<(ParticipantId, EcdsaProtocol), Vec<u8>>,
}

fn all_participants() -> Vec<ParticipantId> {
    vec![CLIENTS[0], CLIENTS[1], SERVER]
}

impl EcdsaClients {
    pub fn new() -> Self {
        Self {
            primitive: SimulatedEcdsa::new(),
            states: HashMap::new(),
            pool: Vec::new(),
            outputs: HashMap::new(),
            public_outputs: HashMap::new(),
        }
    }

    /// Messages addressed to `to` that `step` consumes
    pub fn inbox_for(&self, protocol: EcdsaProtocol, step: u8, to: ParticipantId) -> Vec<PeerMessage> {
        let rounds = consumed_rounds(protocol, step);
        self.pool
            .iter()
            .filter(|m| m.to == to && rounds.contains(&m.round))
            .cloned()
            .collect()
    }

    /// Step-1 seed a client would derive from its own earlier outputs
    pub fn seed(
        &self,
        protocol: EcdsaProtocol,
        me: ParticipantId,
        message_hash: Option<&str>,
    ) -> Option<Vec<u8>> {
        match protocol {
            EcdsaProtocol::Triples => None,
            EcdsaProtocol::Presign => Some(
                PresignSeed {
                    triple_output: hex::encode(&self.outputs[&(me, EcdsaProtocol::Triples)]),
                    key_share: hex::encode([me.0 as u8 + 1; 32]),
                }
                .to_bytes()
                .unwrap(),
            ),
            EcdsaProtocol::Sign => Some(
                SignSeed {
                    presign_output: hex::encode(&self.outputs[&(me, EcdsaProtocol::Presign)]),
                    message_hash: message_hash.unwrap().to_string(),
                }
                .to_bytes()
                .unwrap(),
            ),
        }
    }

    /// Run `step` on one client with an explicit seed
    pub fn step_one(
        &mut self,
        protocol: EcdsaProtocol,
        step: u8,
        me: ParticipantId,
        seed: Option<Vec<u8>>,
    ) {
        if step == 1 {
            self.states.remove(&me);
        }
        let inbox = self
            .inbox_for(protocol, step, me)
            .into_iter()
            .map(|m| InboundMessage {
                round: m.round,
                from: m.from,
                payload: hex::decode(&m.payload).unwrap(),
            })
            .collect();

        let output = self
            .primitive
            .step(StepInput {
                protocol,
                step,
                me,
                participants: all_participants(),
                state: self.states.get(&me).cloned(),
                inbox,
                seed,
            })
            .unwrap();

        self.states.insert(me, output.state);
        for m in output.outbox {
            self.pool.push(PeerMessage {
                round: m.round,
                from: me,
                to: m.to,
                payload: hex::encode(m.payload),
            });
        }
        if let Some(private) = output.output {
            self.outputs.insert((me, protocol), private);
        }
        if let Some(public) = output.public_output {
            self.public_outputs.insert((me, protocol), public);
        }
    }

    /// Forget the previous protocol's messages
    pub fn begin(&mut self) {
        self.pool.clear();
    }

    /// Run `step` on both clients
    pub fn step(&mut self, protocol: EcdsaProtocol, step: u8, message_hash: Option<&str>) {
        if step == 1 {
            self.begin();
        }
        for me in CLIENTS {
            let seed = if step == 1 {
                self.seed(protocol, me, message_hash)
            } else {
                None
            };
            self.step_one(protocol, step, me, seed);
        }
    }

    /// Record the server's outbound messages
    pub fn deliver(&mut self, response: &RoundResponse) {
        self.pool.extend(response.messages.iter().cloned());
    }
}

/// Drive a whole ECDSA protocol: clients and server run each step in turn
pub async fn run_protocol(
    harness: &Harness,
    clients: &mut EcdsaClients,
    session_id: Uuid,
    protocol: EcdsaProtocol,
    message_hash: Option<&str>,
) -> tss_custody::Result<RoundResponse> {
    let mut last = None;
    for step in 1..=protocol.step_count() {
        clients.step(protocol, step, message_hash);
        let request = harness.round_request(
            session_id,
            step,
            clients.inbox_for(protocol, step, SERVER),
            if step == 1 { message_hash.map(str::to_string) } else { None },
        );
        let response = harness.server_step(protocol, request).await?;
        clients.deliver(&response);
        last = Some(response);
    }
    Ok(last.unwrap())
}
