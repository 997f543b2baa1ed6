// Restriction and web forwarding policy

//! Decides, once per tunnel bring-up, whether a connection is restricted,
//! whether its web traffic is forwarded to a local notice page, and whether
//! it must be dropped outright.

use crate::license::LicenseState;
use crate::status::ForwardReason;
use crate::types::{RedirectPorts, UserConfig};

/// Outcome of [`evaluate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restrictions {
    /// Apply the restricted filter
    pub restrict: bool,
    /// Redirect web traffic to a local page
    pub forward: bool,
    /// Local HTTP port when forwarding
    pub forward_http_port: Option<u16>,
    /// Local HTTPS port when forwarding
    pub forward_https_port: Option<u16>,
    /// Why the connection is forwarded
    pub forward_reason: Option<ForwardReason>,
    /// Human readable summary for logs
    pub reason: String,
    /// Refuse the connection instead of restricting it
    pub drop_connection: bool,
}

impl Restrictions {
    fn unrestricted(reason: &str) -> Self {
        Self {
            restrict: false,
            forward: false,
            forward_http_port: None,
            forward_https_port: None,
            forward_reason: None,
            reason: reason.to_string(),
            drop_connection: false,
        }
    }

    fn restricted(reason: &str) -> Self {
        Self {
            restrict: true,
            ..Self::unrestricted(reason)
        }
    }

    fn forwarded(http: u16, https: u16, why: ForwardReason, reason: &str) -> Self {
        Self {
            restrict: true,
            forward: true,
            forward_http_port: Some(http),
            forward_https_port: Some(https),
            forward_reason: Some(why),
            reason: reason.to_string(),
            drop_connection: false,
        }
    }
}

/// Evaluate the restriction rules in precedence order; the first match wins.
///
/// A connection is site-to-site when its user carries a site-to-site
/// section. `user` is `None` for RADIUS authenticated users unknown locally.
pub fn evaluate(
    user: Option<&UserConfig>,
    license: &LicenseState,
    psk_index: u32,
    ports: &RedirectPorts,
) -> Restrictions {
    let site_to_site = user.is_some_and(|u| u.site_to_site.is_some());

    if !license.valid {
        if site_to_site {
            return Restrictions::restricted("license invalid (site-to-site)");
        }
        return Restrictions::forwarded(
            ports.http_license,
            ports.https_license,
            ForwardReason::LicenseInvalid,
            "license invalid",
        );
    }

    if user.is_some_and(|u| u.force_web_redirect) {
        return Restrictions::forwarded(
            ports.http_forced,
            ports.https_forced,
            ForwardReason::UiForced,
            "ui forced",
        );
    }

    if psk_index > 0 && user.is_some_and(|u| u.force_non_primary_psk_web_redirect) {
        return Restrictions::forwarded(
            ports.http_non_primary_psk,
            ports.https_non_primary_psk,
            ForwardReason::UiForced,
            "ui forced, psk index",
        );
    }

    if site_to_site {
        if license.site_to_site_access {
            return Restrictions::unrestricted("site-to-site user allowed");
        }
        return Restrictions {
            drop_connection: true,
            ..Restrictions::restricted("site-to-site user rejected (license prohibits)")
        };
    }

    if license.normal_access {
        return Restrictions::unrestricted("normal user allowed");
    }
    Restrictions::forwarded(
        ports.http_license,
        ports.https_license,
        ForwardReason::LicenseExceeded,
        "normal user rejected (license prohibits)",
    )
}
