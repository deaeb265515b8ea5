// Route guard
// Maps the auth signal onto a navigation decision for each class of route

use crate::auth::AuthSnapshot;

/// Landing route for signed-in users
pub const HOME_ROUTE: &str = "/home";
/// Sign-in route
pub const LOGIN_ROUTE: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Requires a signed-in user
    Protected,
    /// Only for signed-out users (the login page)
    PublicOnly,
    /// Open to everyone
    Public,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// The session is still settling; render nothing route-specific yet
    ShowLoading,
    Render,
    Redirect {
        to: String,
        /// Location to return to after signing in
        from: Option<String>,
    },
}

/// Decide what to do with a navigation to `from`.
///
/// Never redirects while the phase is `Loading`, so a page reload does not
/// bounce a signed-in user through the login page.
pub fn route_decision(snapshot: &AuthSnapshot, kind: RouteKind, from: Option<&str>) -> RouteDecision {
    if snapshot.is_loading() {
        return RouteDecision::ShowLoading;
    }

    match (kind, snapshot.is_authenticated()) {
        (RouteKind::Protected, false) => RouteDecision::Redirect {
            to: LOGIN_ROUTE.to_string(),
            from: from.map(str::to_string),
        },
        (RouteKind::PublicOnly, true) => RouteDecision::Redirect {
            to: from
                .filter(|path| !path.is_empty() && *path != LOGIN_ROUTE)
                .unwrap_or(HOME_ROUTE)
                .to_string(),
            from: None,
        },
        _ => RouteDecision::Render,
    }
}
