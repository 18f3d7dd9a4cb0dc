//! Modern multi-class bootstrap.
//!
//! The handshake runs in seven phases:
//!
//! 1. Negotiate scheme, curve and requested classes (TA1)
//! 2. Decide which classes to grant (TAI1)
//! 3. Exchange X25519 public keys
//! 4. Complete the node's public key with the PIN for authenticated classes (TAI2)
//! 5. Derive and install the temporary key
//! 6. Check the node's echo of the granted classes (TA2)
//! 7. Deliver each class key and check its verification (TA3, TA4, TA5)
//!
//! Every wait races against the session's [`CancelToken`]. On any failure all
//! classes are revoked and the temporary key is removed.

use crate::bootstrap::cancel::{cancel_pair, CancelToken};
use crate::callbacks::{GrantRequest, InclusionUserCallbacks};
use crate::command::{Command, EcdhProfile, Encapsulation, KexFailType, KexParameters, KexScheme};
use crate::controller::Controller;
use crate::error::{SecurityBootstrapFailure, TransportError};
use crate::provisioning::ProvisioningEntry;
use crate::transport::from_node;
use homemesh_core::{CommandClass, NodeId, SecurityClass, SecuritySection};
use homemesh_crypto::{apply_pin, derive_temp_keys, parse_pin, Dsk, EcdhKeyPair, PUBLIC_KEY_LENGTH};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Who decides the grant and supplies the PIN.
pub(crate) enum GrantPolicy {
    /// A pre-provisioned SmartStart entry
    Provisioned(ProvisioningEntry),
    /// The user, through callbacks if there are any
    User(Option<Arc<dyn InclusionUserCallbacks>>),
}

impl GrantPolicy {
    fn callbacks(&self) -> Option<Arc<dyn InclusionUserCallbacks>> {
        match self {
            GrantPolicy::User(callbacks) => callbacks.clone(),
            GrantPolicy::Provisioned(_) => None,
        }
    }
}

struct Deadlines {
    ta1: Duration,
    ta2: Duration,
    ta3: Duration,
    ta4: Duration,
    ta5: Duration,
    tai1: Duration,
    tai2: Duration,
}

impl From<&SecuritySection> for Deadlines {
    fn from(config: &SecuritySection) -> Self {
        Self {
            ta1: Duration::from_millis(config.ta1),
            ta2: Duration::from_millis(config.ta2),
            ta3: Duration::from_millis(config.ta3),
            ta4: Duration::from_millis(config.ta4),
            ta5: Duration::from_millis(config.ta5),
            tai1: Duration::from_millis(config.tai1),
            tai2: Duration::from_millis(config.tai2),
        }
    }
}

/// Why and how a session ended early.
#[derive(Debug)]
struct Abort {
    failure: SecurityBootstrapFailure,
    /// Reason sent to the node, `None` for local timeouts
    notice: Option<KexFailType>,
    /// Close any open user prompt
    notify_user: bool,
}

impl Abort {
    fn protocol(failure: SecurityBootstrapFailure, notice: KexFailType) -> Self {
        Self {
            failure,
            notice: Some(notice),
            notify_user: false,
        }
    }

    fn user_canceled() -> Self {
        Self {
            failure: SecurityBootstrapFailure::UserCanceled,
            notice: Some(KexFailType::BootstrappingCanceled),
            notify_user: true,
        }
    }

    fn timeout() -> Self {
        Self {
            failure: SecurityBootstrapFailure::Timeout,
            notice: None,
            notify_user: true,
        }
    }

    fn transport(error: TransportError) -> Self {
        match error {
            TransportError::Timeout | TransportError::NodeTimeout { .. } => Self::timeout(),
            _ => Self {
                failure: SecurityBootstrapFailure::Unknown,
                notice: None,
                notify_user: true,
            },
        }
    }

    fn unexpected() -> Self {
        Self::transport(TransportError::UnexpectedResponse {
            request: "modern bootstrap",
        })
    }
}

type Step<T> = Result<T, Abort>;

enum Waited {
    Command(Command),
    Canceled(KexFailType),
    Failed(TransportError),
}

struct Granted {
    classes: Vec<SecurityClass>,
    dsk: Dsk,
}

struct Session<'a> {
    controller: &'a Controller,
    node_id: NodeId,
    token: CancelToken,
    policy: GrantPolicy,
    /// Classes this controller holds keys for, strongest first
    grantable: Vec<SecurityClass>,
    deadlines: Deadlines,
}

impl Controller {
    /// Run the modern handshake with a node.
    pub(crate) async fn secure_bootstrap_s2(
        &self,
        node_id: NodeId,
        policy: GrantPolicy,
    ) -> Option<SecurityBootstrapFailure> {
        let grantable: Vec<SecurityClass> = SecurityClass::GRANTABLE
            .into_iter()
            .filter(|class| self.keys.class_key(*class).is_some())
            .collect();
        if !grantable.iter().any(|class| class.is_s2()) {
            warn!(node_id, "No modern network keys configured, node stays insecure");
            self.fail_s2(node_id);
            return Some(SecurityBootstrapFailure::NoKeysConfigured);
        }

        let (cancel, token) = cancel_pair();
        self.attach_session(node_id, cancel);
        let user = policy.callbacks();
        let mut session = Session {
            controller: self,
            node_id,
            token,
            policy,
            grantable,
            deadlines: Deadlines::from(&self.config.security),
        };

        info!(node_id, "Starting modern security bootstrap");
        let result = session.run().await;
        self.detach_session(node_id);

        match result {
            Ok(granted) => {
                self.keys.clear_temporary_key(node_id);
                self.update_device(node_id, |device| {
                    device.set_granted_exactly(&granted.classes);
                    device.dsk = Some(*granted.dsk.as_bytes());
                });
                info!(node_id, granted = ?granted.classes, "Modern security bootstrap complete");
                None
            }
            Err(abort) => {
                warn!(node_id, failure = %abort.failure, "Modern security bootstrap failed");
                if let Some(reason) = abort.notice {
                    if let Err(e) = self
                        .send_command(node_id, Command::KexFail(reason), Encapsulation::None)
                        .await
                    {
                        debug!(node_id, error = %e, "Abort notice not delivered");
                    }
                }
                if abort.notify_user {
                    if let Some(callbacks) = user {
                        callbacks.abort();
                    }
                }
                self.fail_s2(node_id);
                Some(abort.failure)
            }
        }
    }

    fn fail_s2(&self, node_id: NodeId) {
        self.keys.clear_temporary_key(node_id);
        self.update_device(node_id, |device| {
            device.revoke_all_security_classes();
            device.remove_supported(CommandClass::Security2);
        });
    }
}

impl Session<'_> {
    async fn run(&mut self) -> Step<Granted> {
        let controller = self.controller;
        let node_id = self.node_id;

        // 1: negotiate
        self.send(Command::KexGet, Encapsulation::None).await?;
        let Command::KexReport(requested) = self
            .wait(self.deadlines.ta1, SecurityBootstrapFailure::UserCanceled, |c| {
                matches!(c, Command::KexReport(p) if !p.echo)
            })
            .await?
        else {
            return Err(Abort::unexpected());
        };
        let supported = self.negotiate(&requested)?;

        // 2: grant
        let granted = self.grant(&supported, requested.request_csa).await?;
        debug!(node_id, granted = ?granted, "Granting security classes");

        // 3: public keys
        let mut keypair = EcdhKeyPair::generate();
        let own_public = keypair.public_bytes();
        self.send(
            Command::KexSet(KexParameters::new(granted.clone())),
            Encapsulation::None,
        )
        .await?;
        let Command::PublicKeyReport {
            public_key: mut node_public,
            ..
        } = self
            .wait(self.deadlines.ta2, SecurityBootstrapFailure::UserCanceled, |c| {
                matches!(c, Command::PublicKeyReport { including_node: false, .. })
            })
            .await?
        else {
            return Err(Abort::unexpected());
        };
        let tai2_started = Instant::now();
        self.send(
            Command::PublicKeyReport {
                including_node: true,
                public_key: own_public,
            },
            Encapsulation::None,
        )
        .await?;

        // 4: PIN
        if granted.iter().any(|class| class.requires_authentication()) {
            let remaining = self.deadlines.tai2.saturating_sub(tai2_started.elapsed());
            let pin = self.obtain_pin(&node_public, remaining).await?;
            apply_pin(&mut node_public, pin);
        }

        // 5: temporary key
        let shared = keypair.compute_shared_secret(&node_public).map_err(|e| {
            warn!(node_id, error = %e, "Key exchange failed");
            Abort::protocol(
                SecurityBootstrapFailure::Unknown,
                KexFailType::BootstrappingCanceled,
            )
        })?;
        let temp_keys = derive_temp_keys(&shared, &own_public, &node_public);
        controller.keys.set_temporary_key(node_id, temp_keys);

        // 6: echo
        let Command::KexSet(echo) = self
            .wait(self.deadlines.ta2, SecurityBootstrapFailure::S2IncorrectPIN, |c| {
                matches!(c, Command::KexSet(p) if p.echo)
            })
            .await?
        else {
            return Err(Abort::unexpected());
        };
        let offered: BTreeSet<SecurityClass> = granted.iter().copied().collect();
        let echoed: BTreeSet<SecurityClass> = echo.keys.iter().copied().collect();
        if !controller
            .keys
            .has_traffic_used_class(node_id, SecurityClass::Temporary)
            || echoed != offered
        {
            warn!(node_id, offered = ?offered, echoed = ?echoed, "Echoed classes do not match the grant");
            return Err(Abort::protocol(
                SecurityBootstrapFailure::S2WrongSecurityLevel,
                KexFailType::WrongSecurityLevel,
            ));
        }
        self.send(
            Command::KexReport(requested.echoed()),
            Encapsulation::Class(SecurityClass::Temporary),
        )
        .await?;

        // 7: keys
        self.deliver_keys(&granted).await?;

        Ok(Granted {
            classes: granted,
            dsk: Dsk::from_public_key(&node_public),
        })
    }

    /// Classes both sides can use, or the reason there are none.
    fn negotiate(&self, requested: &KexParameters) -> Step<Vec<SecurityClass>> {
        if !requested.schemes.contains(&KexScheme::Kex1) {
            return Err(Abort::protocol(
                SecurityBootstrapFailure::ParameterMismatch,
                KexFailType::NoSupportedScheme,
            ));
        }
        if !requested.curves.contains(&EcdhProfile::Curve25519) {
            return Err(Abort::protocol(
                SecurityBootstrapFailure::ParameterMismatch,
                KexFailType::NoSupportedCurve,
            ));
        }
        let supported: Vec<SecurityClass> = self
            .grantable
            .iter()
            .copied()
            .filter(|class| requested.keys.contains(class))
            .collect();
        if supported.is_empty() {
            warn!(node_id = self.node_id, requested = ?requested.keys, "None of the requested classes can be granted");
            return Err(Abort::protocol(
                SecurityBootstrapFailure::ParameterMismatch,
                KexFailType::NoKeyMatch,
            ));
        }
        Ok(supported)
    }

    async fn grant(&self, supported: &[SecurityClass], client_side_auth: bool) -> Step<Vec<SecurityClass>> {
        let chosen = match &self.policy {
            GrantPolicy::Provisioned(entry) => entry.security_classes.clone(),
            GrantPolicy::User(Some(callbacks)) => {
                let request = GrantRequest {
                    security_classes: supported.to_vec(),
                    client_side_auth,
                };
                match tokio::time::timeout(
                    self.deadlines.tai1,
                    callbacks.grant_security_classes(request),
                )
                .await
                {
                    Ok(Some(classes)) => classes,
                    Ok(None) => {
                        info!(node_id = self.node_id, "User declined the grant");
                        Vec::new()
                    }
                    Err(_) => {
                        warn!(node_id = self.node_id, "No grant decision in time");
                        Vec::new()
                    }
                }
            }
            GrantPolicy::User(None) => {
                warn!(node_id = self.node_id, "Grant decision needed but no user callbacks are set");
                return Err(Abort {
                    failure: SecurityBootstrapFailure::S2NoUserCallbacks,
                    notice: Some(KexFailType::BootstrappingCanceled),
                    notify_user: false,
                });
            }
        };

        let granted: Vec<SecurityClass> = supported
            .iter()
            .copied()
            .filter(|class| chosen.contains(class))
            .collect();
        if granted.is_empty() {
            return Err(Abort::user_canceled());
        }
        Ok(granted)
    }

    /// Ask for the PIN. The prompt races the cancel token and a node abort.
    async fn obtain_pin(&mut self, node_public: &[u8; PUBLIC_KEY_LENGTH], remaining: Duration) -> Step<u16> {
        let node_id = self.node_id;
        let dsk = Dsk::from_public_key(node_public);
        let callbacks = match &self.policy {
            GrantPolicy::Provisioned(entry) => {
                return entry
                    .parsed_dsk()
                    .ok()
                    .map(|known| known.pin())
                    .ok_or_else(Abort::user_canceled);
            }
            GrantPolicy::User(Some(callbacks)) => Arc::clone(callbacks),
            GrantPolicy::User(None) => return Err(Abort::user_canceled()),
        };

        let controller = self.controller;
        let node_abort = from_node(node_id, |c| matches!(c, Command::KexFail(_)));
        let entered = tokio::select! {
            biased;
            reason = self.token.cancelled() => {
                warn!(node_id, reason = ?reason, "Handshake canceled during PIN entry");
                return Err(Abort {
                    failure: SecurityBootstrapFailure::UserCanceled,
                    notice: Some(reason),
                    notify_user: true,
                });
            }
            entered = tokio::time::timeout(remaining, callbacks.validate_dsk_and_enter_pin(dsk.masked())) => entered,
            result = controller.transport.wait_for_command(node_abort, remaining) => match result {
                Ok(_) => {
                    warn!(node_id, "Node aborted the handshake during PIN entry");
                    return Err(Abort {
                        failure: SecurityBootstrapFailure::NodeCanceled,
                        notice: None,
                        notify_user: true,
                    });
                }
                Err(TransportError::Timeout | TransportError::NodeTimeout { .. }) => Ok(None),
                Err(e) => return Err(Abort::transport(e)),
            },
        };

        let pin = match entered {
            Ok(Some(text)) => match parse_pin(&text) {
                Ok(pin) => Some(pin),
                Err(e) => {
                    warn!(node_id, error = %e, "Invalid PIN entered");
                    None
                }
            },
            Ok(None) => None,
            Err(_) => {
                warn!(node_id, "No PIN entered in time");
                None
            }
        };
        pin.ok_or_else(Abort::user_canceled)
    }

    async fn deliver_keys(&mut self, granted: &[SecurityClass]) -> Step<()> {
        let controller = self.controller;
        let node_id = self.node_id;
        let mut outstanding = granted.to_vec();

        // the node picks the order
        while !outstanding.is_empty() {
            let Command::NetworkKeyGet { class } = self
                .wait(self.deadlines.ta3, SecurityBootstrapFailure::UserCanceled, |c| {
                    matches!(c, Command::NetworkKeyGet { .. })
                })
                .await?
            else {
                return Err(Abort::unexpected());
            };
            if !controller
                .keys
                .has_traffic_used_class(node_id, SecurityClass::Temporary)
            {
                warn!(node_id, class = %class, "Key request did not use the temporary key");
                return Err(Abort::protocol(
                    SecurityBootstrapFailure::Unknown,
                    KexFailType::NoVerify,
                ));
            }
            if !outstanding.contains(&class) {
                warn!(node_id, class = %class, "Node requested a key that was not granted");
                return Err(Abort::protocol(
                    SecurityBootstrapFailure::Unknown,
                    KexFailType::KeyNotGranted,
                ));
            }
            let Some(key) = controller.keys.class_key(class) else {
                return Err(Abort::protocol(
                    SecurityBootstrapFailure::Unknown,
                    KexFailType::KeyNotGranted,
                ));
            };

            self.send(
                Command::NetworkKeyReport { class, key },
                Encapsulation::Class(SecurityClass::Temporary),
            )
            .await?;
            // decrypt the verification with the class key
            controller.update_device(node_id, |device| device.set_security_class(class, true));

            self.wait(self.deadlines.ta4, SecurityBootstrapFailure::UserCanceled, |c| {
                matches!(c, Command::NetworkKeyVerify)
            })
            .await?;
            if !controller.keys.has_traffic_used_class(node_id, class) {
                warn!(node_id, class = %class, "Key verification did not use the class key");
                return Err(Abort::protocol(
                    SecurityBootstrapFailure::Unknown,
                    KexFailType::NoVerify,
                ));
            }
            controller.update_device(node_id, |device| device.set_security_class(class, false));

            self.send(
                Command::TransferEnd {
                    key_verified: true,
                    key_request_complete: false,
                },
                Encapsulation::Class(SecurityClass::Temporary),
            )
            .await?;
            outstanding.retain(|pending| *pending != class);
            debug!(node_id, class = %class, "Network key delivered");
        }

        let Command::TransferEnd {
            key_request_complete,
            ..
        } = self
            .wait(self.deadlines.ta5, SecurityBootstrapFailure::UserCanceled, |c| {
                matches!(c, Command::TransferEnd { .. })
            })
            .await?
        else {
            return Err(Abort::unexpected());
        };
        if !key_request_complete {
            warn!(node_id, "Node reported an incomplete key exchange");
            return Err(Abort::timeout());
        }
        Ok(())
    }

    async fn send(&self, command: Command, encapsulation: Encapsulation) -> Step<()> {
        self.controller
            .send_command(self.node_id, command, encapsulation)
            .await
            .map_err(Abort::transport)
    }

    /// Wait for a command from the node, a node abort, or a cancel.
    async fn wait<F>(
        &mut self,
        deadline: Duration,
        on_cancel: SecurityBootstrapFailure,
        expected: F,
    ) -> Step<Command>
    where
        F: Fn(&Command) -> bool + Send + Sync + 'static,
    {
        let controller = self.controller;
        let filter = from_node(self.node_id, move |c| {
            matches!(c, Command::KexFail(_)) || expected(c)
        });

        let waited = tokio::select! {
            biased;
            reason = self.token.cancelled() => Waited::Canceled(reason),
            result = controller.transport.wait_for_command(filter, deadline) => match result {
                Ok(inbound) => Waited::Command(inbound.command),
                Err(e) => Waited::Failed(e),
            },
        };

        match waited {
            Waited::Command(Command::KexFail(reason)) => {
                warn!(node_id = self.node_id, reason = ?reason, "Node aborted the handshake");
                Err(Abort {
                    failure: SecurityBootstrapFailure::NodeCanceled,
                    notice: None,
                    notify_user: true,
                })
            }
            Waited::Command(command) => Ok(command),
            Waited::Canceled(reason) => {
                warn!(node_id = self.node_id, reason = ?reason, "Handshake canceled");
                Err(Abort {
                    failure: on_cancel,
                    notice: Some(reason),
                    notify_user: true,
                })
            }
            Waited::Failed(e) => {
                debug!(node_id = self.node_id, error = %e, "Handshake wait failed");
                Err(Abort::transport(e))
            }
        }
    }
}
