//! Contract Test: Start-up
//!
//! Constraints verified:
//! - A started node has its listener, accounts and limiter installed
//! - Start-up either fully provisions the node or leaves nothing behind
//! - Relay routes go in before the node itself
//! - The controller cannot be started twice

mod common;

use common::*;
use nodectl_core::model::NodeType;
use nodectl_core::tag::Tag;
use nodectl_core::traffic::EngineOp;
use nodectl_core::traits::InboundKind;
use nodectl_core::{ControllerEvent, Error, MemoryTrafficEngine, NodeDescriptor, Phase};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn start_provisions_listener_accounts_and_limiter() {
    let engine = MemoryTrafficEngine::new();
    let api = ScriptedApi::with_node(vless_node(443), accounts(&[1, 2]));
    let (controller, mut events) = controller(&api, engine.clone());

    assert_ok!(controller.start().await);

    let node_tag = Tag::new("Vless_443_1");
    assert!(engine.has_inbound(&node_tag).await);
    assert!(engine.has_outbound(&node_tag).await);
    assert_eq!(engine.account_uids(&node_tag).await, vec![1, 2]);
    let limiter = engine.limiter(&node_tag).await.expect("limiter installed");
    assert_eq!(limiter.accounts.len(), 2);

    assert_eq!(controller.phase(), Phase::Provisioned);
    assert_eq!(controller.current_tag().await, Some(node_tag.clone()));
    assert_eq!(controller.provisioned_accounts().await, accounts(&[1, 2]));
    assert!(drain_events(&mut events).contains(&ControllerEvent::Started {
        node_tag,
        accounts: 2
    }));

    controller.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn missing_descriptor_is_a_startup_error() {
    let engine = MemoryTrafficEngine::new();
    let api = ScriptedApi::new();
    api.set_accounts(accounts(&[1]));
    let (controller, _events) = controller(&api, engine.clone());

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, Error::Startup(_)), "got {:?}", err);
    assert_eq!(controller.phase(), Phase::Uninitialized);
    assert!(engine.operations().await.is_empty());
}

#[tokio::test]
async fn fetch_errors_are_startup_errors() {
    let engine = MemoryTrafficEngine::new();
    let api = ScriptedApi::new();
    api.set_node(vless_node(443));
    api.fail_accounts_once("502 Bad Gateway");
    let (controller, _events) = controller(&api, engine.clone());

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, Error::Startup(_)));
    assert!(engine.inbound_tags().await.is_empty());
}

#[tokio::test]
async fn failed_limiter_rolls_back_everything() {
    let memory = MemoryTrafficEngine::new();
    let engine = FailingEngine::new(memory.clone());
    engine.fail_limiter(true);
    let api = ScriptedApi::with_node(vless_node(443), accounts(&[1, 2]));
    let (controller, _events) = controller(&api, engine);

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, Error::Startup(_)));

    assert!(memory.inbound_tags().await.is_empty());
    assert!(memory.outbound_tags().await.is_empty());
    assert!(memory.accounts(&Tag::new("Vless_443_1")).await.is_empty());
    assert_eq!(controller.current_tag().await, None);
}

#[tokio::test]
async fn failed_relay_fetch_on_start_installs_nothing() {
    let engine = MemoryTrafficEngine::new();
    let api = ScriptedApi::with_node(relayed_node(443), accounts(&[1]));
    let (controller, _events) = controller(&api, engine.clone());

    assert_err!(controller.start().await);
    assert!(engine.operations().await.is_empty());
}

#[tokio::test]
async fn relay_routes_are_installed_before_the_node() {
    let engine = MemoryTrafficEngine::new();
    let api = ScriptedApi::with_node(relayed_node(443), accounts(&[1, 2]));
    api.set_relay(Some(relay_target(9)));
    let (controller, mut events) = controller(&api, engine.clone());

    controller.start().await.unwrap();

    let ops = engine.operations().await;
    let relay_outbound = ops
        .iter()
        .position(|op| *op == EngineOp::AddOutbound(Tag::new("Relay_1_Vless_443_9_1")))
        .expect("relay outbound added");
    let node_inbound = ops
        .iter()
        .position(|op| *op == EngineOp::AddInbound(Tag::new("Vless_443_1")))
        .expect("node inbound added");
    assert!(relay_outbound < node_inbound);

    assert_eq!(
        engine.route_of(&account_tag("Vless_443_1", 2)).await,
        Some(Tag::new("Relay_1_Vless_443_9_2"))
    );
    assert_eq!(controller.relay_tag().await, Some(Tag::new("Relay_1_Vless_443_9")));
    assert!(drain_events(&mut events).contains(&ControllerEvent::RelayProvisioned {
        relay_tag: Tag::new("Relay_1_Vless_443_9"),
        routes: 2
    }));

    controller.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn plugin_node_gets_a_forwarder_pair() {
    let engine = MemoryTrafficEngine::new();
    let mut node = NodeDescriptor::new(NodeType::ShadowsocksPlugin, 1, 8388);
    node.transport = "ws".to_string();
    node.cipher_method = "2022-blake3-aes-128-gcm".to_string();
    let api = ScriptedApi::with_node(node, accounts(&[1]));
    let (controller, _events) = controller(&api, engine.clone());

    controller.start().await.unwrap();

    let proxy = engine
        .inbound(&Tag::new("Shadowsocks-Plugin_8388_1"))
        .await
        .expect("proxy inbound");
    assert_eq!(proxy.kind, InboundKind::Proxy(NodeType::ShadowsocksPlugin));
    assert_eq!(proxy.transport, "tcp");

    let forwarder_tag = Tag::new("dokodemo-door_Shadowsocks-Plugin_8388_1+1");
    let forwarder = engine.inbound(&forwarder_tag).await.expect("forwarder inbound");
    assert_eq!((forwarder.port, forwarder.transport.as_str()), (8389, "ws"));
    assert!(engine.has_outbound(&forwarder_tag).await);

    assert_eq!(
        engine.account_uids(&Tag::new("Shadowsocks-Plugin_8388_1")).await,
        vec![1]
    );

    controller.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn start_binds_fetched_rules() {
    let engine = MemoryTrafficEngine::new();
    let api = ScriptedApi::with_node(vless_node(443), accounts(&[1]));
    api.set_rules(vec![
        nodectl_core::DetectRule::new(1, r"(.*\.)?torrent\.com").unwrap(),
    ]);
    let (controller, _events) = controller(&api, engine.clone());

    controller.start().await.unwrap();

    let rules = engine.rules(&Tag::new("Vless_443_1")).await.expect("rules bound");
    assert_eq!(rules.len(), 1);
    assert_eq!(controller.status().await.rules, 1);

    controller.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn rule_fetch_failure_does_not_block_start() {
    let engine = MemoryTrafficEngine::new();
    let api = ScriptedApi::with_node(vless_node(443), accounts(&[1]));
    api.fail_rules_once("timeout");
    let (controller, _events) = controller(&api, engine.clone());

    assert_ok!(controller.start().await);
    assert!(engine.rules(&Tag::new("Vless_443_1")).await.is_none());

    controller.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn cannot_start_twice() {
    let api = ScriptedApi::with_node(vless_node(443), accounts(&[1]));
    let (controller, _events) = controller(&api, MemoryTrafficEngine::new());

    controller.start().await.unwrap();
    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    controller.stop(Duration::from_secs(1)).await.unwrap();
}
