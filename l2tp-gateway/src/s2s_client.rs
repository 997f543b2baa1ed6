// Site-to-site client connections

//! Outgoing site-to-site tunnels: an IKE connection added to pluto with
//! `ipsec whack`, then L2TP profiles, a tunnel and a session created through
//! `openl2tpconfig`. Everything is named after the connection identifier
//! `s2s-<index>-<incarnation>`, so a reinitiated tunnel never collides with
//! a previous instance that is still being torn down.

use crate::daemons::{IKE_PROPOSAL, IPSEC, TRUE};
use crate::exec::{run_checked, CommandOutput, CommandSpec, Executor};
use crate::ipsec::OPENL2TPCONFIG;
use crate::types::{L2TP_CLIENT_PORT, L2TP_PEER_PORT};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::net::Ipv4Addr;

/// SA lifetime for client connections, seconds
const CLIENT_SA_LIFETIME: u32 = 28800;
const CLIENT_KEYING_TRIES: u32 = 5;
const PPP_MTU: u32 = 1400;

/// Identifier of one incarnation of a site-to-site client tunnel
pub fn identifier(index: usize, incarnation: u64) -> String {
    format!("s2s-{}-{}", index, incarnation)
}

/// Everything needed to bring up one client tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnection {
    /// IKE connection name
    pub identifier: String,
    /// PPP user name sent to the server
    pub username: String,
    /// PPP password
    pub password: String,
    /// Local address the tunnel originates from
    pub own_address: Ipv4Addr,
    /// Server address
    pub remote_address: Ipv4Addr,
}

struct Names {
    ppp_profile: String,
    tunnel_profile: String,
    session_profile: String,
    peer_profile: String,
    tunnel: String,
    session: String,
}

impl Names {
    fn new(identifier: &str) -> Self {
        Self {
            ppp_profile: format!("ppp-prof-{}", identifier),
            tunnel_profile: format!("tunnel-prof-{}", identifier),
            session_profile: format!("session-prof-{}", identifier),
            peer_profile: format!("peer-prof-{}", identifier),
            tunnel: format!("tunnel-{}", identifier),
            session: format!("session-{}", identifier),
        }
    }
}

/// Tunnel id from openl2tpconfig's "Created tunnel N" report
pub fn parse_created_tunnel(output: &str) -> Option<u32> {
    output
        .lines()
        .find_map(|l| l.trim().strip_prefix("Created tunnel "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
}

/// Tunnel and session ids from "Created session T/S"
pub fn parse_created_session(output: &str) -> Option<(u32, u32)> {
    let rest = output
        .lines()
        .find_map(|l| l.trim().strip_prefix("Created session "))?;
    let (tunnel, session) = rest.split_whitespace().next()?.split_once('/')?;
    Some((tunnel.parse().ok()?, session.parse().ok()?))
}

fn both_streams(out: &CommandOutput) -> String {
    format!("{}\n{}", out.stderr, out.stdout)
}

/// Add the IKE connection and initiate it without waiting for completion
pub async fn ike_start(exec: &dyn Executor, conn: &ClientConnection) -> Result<()> {
    let own = conn.own_address.to_string();
    let remote = conn.remote_address.to_string();
    let cmd = CommandSpec::new(IPSEC)
        .args(["whack", "--name", &conn.identifier])
        .args(["--host", &own, "--nexthop", &own])
        .arg("--clientprotoport")
        .arg(format!("17/{}", L2TP_CLIENT_PORT))
        .args(["--updown", TRUE])
        .args(["--to", "--host", &remote])
        .arg("--clientprotoport")
        .arg(format!("17/{}", L2TP_PEER_PORT))
        .args(["--updown", TRUE])
        .args(["--psk", "--encrypt", IKE_PROPOSAL])
        .arg("--ikelifetime")
        .arg(CLIENT_SA_LIFETIME.to_string())
        .arg("--ipseclifetime")
        .arg(CLIENT_SA_LIFETIME.to_string())
        .arg("--keyingtries")
        .arg(CLIENT_KEYING_TRIES.to_string());
    // whack exit codes carry pluto progress, not success
    let out = exec.run(cmd).await?;
    log::debug!("whack add {}: {:?}", conn.identifier, out.code);

    let out = exec
        .run(
            CommandSpec::new(IPSEC)
                .args(["whack", "--initiate", "--asynchronous", "--name"])
                .arg(&conn.identifier),
        )
        .await?;
    log::debug!("whack initiate {}: {:?}", conn.identifier, out.code);
    Ok(())
}

/// Tear down the IKE connection, ignoring failures
pub async fn ike_stop(exec: &dyn Executor, identifier: &str) {
    let cmd = CommandSpec::new(IPSEC)
        .args(["whack", "--delete", "--name"])
        .arg(identifier);
    if let Err(e) = exec.run(cmd).await {
        log::warn!("whack delete {}: {:#}", identifier, e);
    }
}

fn profiles_script(names: &Names, remote: Ipv4Addr) -> String {
    let mut s = String::new();
    let mut line = |l: String| {
        s.push_str(&l);
        s.push('\n');
    };

    line(format!("ppp profile create profile_name={}", names.ppp_profile));
    for (key, value) in [
        ("default_route", "no".to_string()),
        ("multilink", "no".to_string()),
        ("use_radius", "no".to_string()),
        ("idle_timeout", "0".to_string()),
        ("mtu", PPP_MTU.to_string()),
        ("mru", PPP_MTU.to_string()),
        ("max_connect_time", "0".to_string()),
        ("max_failure_count", "10".to_string()),
        ("trace_flags", "0".to_string()),
    ] {
        line(format!(
            "ppp profile modify profile_name={} {}={}",
            names.ppp_profile, key, value
        ));
    }
    // Auth and compression options must each go on a single line
    line(format!(
        "ppp profile modify profile_name={} req_none=yes auth_pap=yes auth_chap=yes \
         auth_mschapv1=no auth_mschapv2=no auth_eap=no req_pap=no req_chap=no \
         req_mschapv1=no req_mschapv2=no req_eap=no",
        names.ppp_profile
    ));
    line(format!("ppp profile modify profile_name={} mppe=no", names.ppp_profile));
    line(format!(
        "ppp profile modify profile_name={} comp_mppc=no comp_accomp=yes comp_pcomp=no \
         comp_bsdcomp=no comp_deflate=yes comp_predictor=no comp_vj=no comp_ccomp_vj=no \
         comp_ask_deflate=yes comp_ask_bsdcomp=no",
        names.ppp_profile
    ));

    line(format!("tunnel profile create profile_name={}", names.tunnel_profile));
    for (key, value) in [
        ("our_udp_port", L2TP_CLIENT_PORT.to_string()),
        ("peer_udp_port", L2TP_PEER_PORT.to_string()),
        ("mtu", "1460".to_string()),
        ("hello_timeout", "60".to_string()),
        ("retry_timeout", "3".to_string()),
        ("idle_timeout", "0".to_string()),
        ("rx_window_size", "4".to_string()),
        ("tx_window_size", "10".to_string()),
        ("max_retries", "5".to_string()),
        ("framing_caps", "any".to_string()),
        ("bearer_caps", "any".to_string()),
        ("trace_flags", "0".to_string()),
    ] {
        line(format!(
            "tunnel profile modify profile_name={} {}={}",
            names.tunnel_profile, key, value
        ));
    }

    line(format!("session profile create profile_name={}", names.session_profile));
    for (key, value) in [
        ("sequencing_required", "no"),
        ("use_sequence_numbers", "no"),
        ("trace_flags", "0"),
    ] {
        line(format!(
            "session profile modify profile_name={} {}={}",
            names.session_profile, key, value
        ));
    }

    line(format!("peer profile create profile_name={}", names.peer_profile));
    for (key, value) in [
        ("peer_ipaddr", remote.to_string()),
        ("peer_port", L2TP_PEER_PORT.to_string()),
        ("ppp_profile_name", names.ppp_profile.clone()),
        ("session_profile_name", names.session_profile.clone()),
        ("tunnel_profile_name", names.tunnel_profile.clone()),
    ] {
        line(format!(
            "peer profile modify profile_name={} {}={}",
            names.peer_profile, key, value
        ));
    }

    line(String::new());
    line("quit".to_string());
    s
}

async fn openl2tpconfig(exec: &dyn Executor, script: String, what: &str) -> Result<CommandOutput> {
    log::debug!("openl2tpconfig {}:\n{}", what, script);
    run_checked(exec, CommandSpec::new(OPENL2TPCONFIG).stdin(script))
        .await
        .with_context(|| format!("failed to {}", what))
}

/// Create profiles, tunnel and session. Returns the (tunnel, session) ids
/// openl2tp picked.
pub async fn l2tp_start(exec: &dyn Executor, conn: &ClientConnection) -> Result<(u32, u32)> {
    let names = Names::new(&conn.identifier);

    openl2tpconfig(
        exec,
        profiles_script(&names, conn.remote_address),
        "create client-mode profiles",
    )
    .await?;

    // openl2tp ignores a requested tunnel_id, so the assigned one is parsed
    let mut script = format!("tunnel create tunnel_name={}", names.tunnel);
    let _ = write!(
        script,
        " src_ipaddr={} our_udp_port={} peer_udp_port={} dest_ipaddr={} \
         peer_profile_name={} profile_name={} session_profile_name={} use_udp_checksums=yes\nquit\n",
        conn.own_address,
        L2TP_CLIENT_PORT,
        L2TP_PEER_PORT,
        conn.remote_address,
        names.peer_profile,
        names.tunnel_profile,
        names.session_profile,
    );
    let out = openl2tpconfig(exec, script, "create client-mode tunnel").await?;
    let tunnel_id = parse_created_tunnel(&both_streams(&out)).with_context(|| {
        format!(
            "could not figure tunnel id of site-to-site tunnel for {}",
            conn.username
        )
    })?;

    let script = format!(
        "session create session_name={} tunnel_name={} tunnel_id={} profile_name={} \
         ppp_profile_name={} user_name={} user_password={}\nquit\n",
        names.session,
        names.tunnel,
        tunnel_id,
        names.session_profile,
        names.ppp_profile,
        conn.username,
        conn.password,
    );
    let out = openl2tpconfig(exec, script, "create client-mode session").await?;
    let (tunnel, session) = parse_created_session(&both_streams(&out)).with_context(|| {
        format!(
            "could not figure session id of site-to-site tunnel for {}",
            conn.username
        )
    })?;
    anyhow::ensure!(
        tunnel == tunnel_id,
        "session created in tunnel {} instead of {}",
        tunnel,
        tunnel_id
    );

    log::info!(
        "created tunnel and session ({}/{}) for site-to-site client {}",
        tunnel,
        session,
        conn.username
    );
    Ok((tunnel, session))
}

/// Delete the session, tunnel and profiles. Missing objects are fine.
pub async fn l2tp_stop(exec: &dyn Executor, identifier: &str) {
    let names = Names::new(identifier);
    let script = format!(
        "session delete tunnel_name={} session_name={}\n\
         tunnel delete tunnel_name={}\n\
         ppp profile delete profile_name={}\n\
         tunnel profile delete profile_name={}\n\
         session profile delete profile_name={}\n\
         peer profile delete profile_name={}\n\
         quit\n",
        names.tunnel,
        names.session,
        names.tunnel,
        names.ppp_profile,
        names.tunnel_profile,
        names.session_profile,
        names.peer_profile,
    );
    match exec.run(CommandSpec::new(OPENL2TPCONFIG).stdin(script)).await {
        Ok(out) if !out.success() => {
            log::debug!("openl2tpconfig delete {}: {}", identifier, out.stderr.trim())
        }
        Ok(_) => {}
        Err(e) => log::warn!("openl2tpconfig delete {}: {:#}", identifier, e),
    }
}

/// IKE first, then L2TP
pub async fn start(exec: &dyn Executor, conn: &ClientConnection) -> Result<(u32, u32)> {
    ike_start(exec, conn).await?;
    l2tp_start(exec, conn).await
}

/// Reverse of [`start`], best effort
pub async fn stop(exec: &dyn Executor, identifier: &str) {
    l2tp_stop(exec, identifier).await;
    ike_stop(exec, identifier).await;
}
