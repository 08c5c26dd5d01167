//! The netfilter chain invariants: `YEET_PREROUTING` and `YEET_POSTROUTING`
//! each exist, each are spliced into their parent chain exactly once, and
//! carry a fixed first rule ahead of any per-endpoint rules. Every call here
//! is safe to repeat — idempotence is the whole point of a reconcile loop.

use std::path::Path;

use anyhow::Result;
use command::run_yeet_command;
use tracing::instrument;
use yeet_entities::{Log, ProtoPort};

pub const PREROUTING_CHAIN: &str = "YEET_PREROUTING";
pub const POSTROUTING_CHAIN: &str = "YEET_POSTROUTING";
const BRIDGE_IF: &str = "br0";

#[instrument]
async fn iptables(stage: &str, args: &str) -> Log {
  run_yeet_command(stage, Path::new("/"), format!("iptables -t nat {args}")).await
}

async fn ensure_chain_exists(chain: &str) -> Log {
  let log = iptables("create-chain", &format!("-N {chain}")).await;
  if log.success || log.stderr.contains("Chain already exists") {
    Log { success: true, ..log }
  } else {
    log
  }
}

async fn rule_exists(chain: &str, rule: &str) -> bool {
  iptables("check-rule", &format!("-C {chain} {rule}")).await.success
}

async fn ensure_spliced_once(parent: &str, chain: &str) -> Result<Log> {
  if rule_exists(parent, &format!("-j {chain}")).await {
    return Ok(Log::simple("splice", format!("{chain} already spliced into {parent}")));
  }
  Ok(iptables("splice", &format!("-A {parent} -j {chain}")).await)
}

/// Creates both chains, splices each into its parent exactly once, and
/// installs each chain's fixed first rule. Safe to call on every reconcile.
#[instrument]
pub async fn ensure_base_chains() -> Result<Vec<Log>> {
  let mut logs = Vec::new();

  logs.push(ensure_chain_exists(PREROUTING_CHAIN).await);
  logs.push(ensure_spliced_once("PREROUTING", PREROUTING_CHAIN).await?);
  if !rule_exists(PREROUTING_CHAIN, &format!("-i {BRIDGE_IF} -j RETURN")).await {
    logs.push(iptables("first-rule", &format!("-I {PREROUTING_CHAIN} 1 -i {BRIDGE_IF} -j RETURN")).await);
  }

  logs.push(ensure_chain_exists(POSTROUTING_CHAIN).await);
  logs.push(ensure_spliced_once("POSTROUTING", POSTROUTING_CHAIN).await?);
  let return_rule = format!("-o {BRIDGE_IF} -m addrtype ! --src-type LOCAL -j RETURN");
  if !rule_exists(POSTROUTING_CHAIN, &return_rule).await {
    logs.push(iptables("first-rule", &format!("-I {POSTROUTING_CHAIN} 1 {return_rule}")).await);
  }
  if !rule_exists(POSTROUTING_CHAIN, "-j MASQUERADE").await {
    logs.push(iptables("masquerade-rule", &format!("-A {POSTROUTING_CHAIN} -j MASQUERADE")).await);
  }

  Ok(logs)
}

/// Installs a DNAT rule for `pp` forwarding to `dest_ip:dest_port`, plus
/// the matching OUTPUT-chain rule so a loopback client reaches the same
/// destination. Both are tagged so `remove_dnat` can find and delete them.
#[instrument]
pub async fn add_dnat(pp: ProtoPort, dest_ip: &str, dest_port: u16) -> Result<Vec<Log>> {
  let proto = pp.iptables_name();
  let prerouting_args = format!(
    "-A {PREROUTING_CHAIN} -p {proto} --dport {} -j DNAT --to-destination {dest_ip}:{dest_port}",
    pp.port
  );
  let output_args = format!(
    "-A OUTPUT -p {proto} --dport {} -j DNAT --to-destination {dest_ip}:{dest_port}",
    pp.port
  );
  Ok(vec![iptables("dnat", &prerouting_args).await, iptables("dnat-output", &output_args).await])
}

#[instrument]
pub async fn remove_dnat(pp: ProtoPort, dest_ip: &str, dest_port: u16) -> Result<Vec<Log>> {
  let proto = pp.iptables_name();
  let prerouting_args = format!(
    "-D {PREROUTING_CHAIN} -p {proto} --dport {} -j DNAT --to-destination {dest_ip}:{dest_port}",
    pp.port
  );
  let output_args = format!(
    "-D OUTPUT -p {proto} --dport {} -j DNAT --to-destination {dest_ip}:{dest_port}",
    pp.port
  );
  Ok(vec![iptables("dnat-remove", &prerouting_args).await, iptables("dnat-output-remove", &output_args).await])
}
