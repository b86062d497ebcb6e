use std::fmt;

/// Why a session attempt failed or a session was lost
///
/// Values below `0x1000` mirror the rejection codes the network reports in
/// session-management signaling; negative values are faults detected locally
/// by the radio layer; the remainder are framework-local causes that never
/// appear on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FailCause {
    /// The operator has barred packet-data service for this subscriber
    OperatorBarred,
    /// The network is short of resources for a new bearer
    InsufficientResources,
    /// The requested access point name is missing or unknown to the network
    MissingUnknownApn,
    /// The requested PDP address or type cannot be provided
    UnknownPdpAddressType,
    /// Authentication with the network failed
    UserAuthentication,
    /// The gateway rejected the activation
    ActivationRejectGgsn,
    /// The network rejected the activation for an unspecified reason
    ActivationRejectUnspecified,
    /// The requested service option is not supported
    ServiceOptionNotSupported,
    /// The subscriber is not provisioned for the requested service option
    ServiceOptionNotSubscribed,
    /// The requested service option is temporarily out of order
    ServiceOptionOutOfOrder,
    /// The network-layer service access point identifier is already in use
    NsapiInUse,
    /// The network permits only an IPv4 bearer for this profile
    OnlyIpv4Allowed,
    /// The network permits only an IPv6 bearer for this profile
    OnlyIpv6Allowed,
    /// The network permits only a single bearer at a time
    OnlySingleBearerAllowed,
    /// Unrecoverable protocol error in session-management signaling
    ProtocolErrors,
    /// The device failed or lost circuit-domain registration
    RegistrationFail,
    /// The device failed or lost packet-domain registration
    GprsRegistrationFail,
    /// Radio signal was lost mid-attempt
    SignalLost,
    /// The preferred radio technology changed underneath the attempt
    PreferredRadioTechChanged,
    /// The radio was powered off
    RadioPowerOff,
    /// A tethered call is active and blocks packet data
    TetheredCallActive,
    /// The radio reported an error it could not attribute
    ErrorUnspecified,
    /// The cause could not be determined
    Unknown,
    /// The radio is not available to service requests
    RadioNotAvailable,
    /// Activation nominally succeeded but the returned parameters are unusable
    UnacceptableNetworkParameter,
    /// The completion channel back to the requester is broken
    CompletionChannelBroken,
}

impl FailCause {
    /// Map a raw transport status code to a cause
    ///
    /// Codes this taxonomy does not know collapse to [`FailCause::Unknown`].
    pub fn from_transport_code(code: i32) -> Self {
        use FailCause::*;
        match code {
            0x08 => OperatorBarred,
            0x1A => InsufficientResources,
            0x1B => MissingUnknownApn,
            0x1C => UnknownPdpAddressType,
            0x1D => UserAuthentication,
            0x1E => ActivationRejectGgsn,
            0x1F => ActivationRejectUnspecified,
            0x20 => ServiceOptionNotSupported,
            0x21 => ServiceOptionNotSubscribed,
            0x22 => ServiceOptionOutOfOrder,
            0x23 => NsapiInUse,
            0x32 => OnlyIpv4Allowed,
            0x33 => OnlyIpv6Allowed,
            0x34 => OnlySingleBearerAllowed,
            0x6F => ProtocolErrors,
            -1 => RegistrationFail,
            -2 => GprsRegistrationFail,
            -3 => SignalLost,
            -4 => PreferredRadioTechChanged,
            -5 => RadioPowerOff,
            -6 => TetheredCallActive,
            0xFFFF => ErrorUnspecified,
            _ => Unknown,
        }
    }

    /// Whether retrying the attempt is pointless
    pub fn is_permanent(self) -> bool {
        use FailCause::*;
        matches!(
            self,
            OperatorBarred
                | MissingUnknownApn
                | UnknownPdpAddressType
                | UserAuthentication
                | ServiceOptionNotSupported
                | ServiceOptionNotSubscribed
                | NsapiInUse
                | ProtocolErrors
        )
    }

    /// Whether the cause is worth recording for diagnostics
    ///
    /// A superset of [`is_permanent`](Self::is_permanent) that also covers
    /// congestion-style rejections.
    pub fn is_loggable(self) -> bool {
        use FailCause::*;
        self.is_permanent()
            || matches!(
                self,
                InsufficientResources
                    | ActivationRejectGgsn
                    | ActivationRejectUnspecified
                    | ServiceOptionOutOfOrder
                    | UnacceptableNetworkParameter
            )
    }
}

impl fmt::Display for FailCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FailCause::*;
        let s = match *self {
            OperatorBarred => "packet-data service barred by the operator",
            InsufficientResources => "the network has insufficient resources",
            MissingUnknownApn => "the access point name is missing or unknown",
            UnknownPdpAddressType => "the requested address or type cannot be provided",
            UserAuthentication => "authentication failed",
            ActivationRejectGgsn => "the gateway rejected the activation",
            ActivationRejectUnspecified => "activation rejected, unspecified",
            ServiceOptionNotSupported => "service option not supported",
            ServiceOptionNotSubscribed => "service option not subscribed",
            ServiceOptionOutOfOrder => "service option temporarily out of order",
            NsapiInUse => "NSAPI already in use",
            OnlyIpv4Allowed => "only an IPv4 bearer is allowed",
            OnlyIpv6Allowed => "only an IPv6 bearer is allowed",
            OnlySingleBearerAllowed => "only a single bearer is allowed",
            ProtocolErrors => "session-management protocol error",
            RegistrationFail => "circuit-domain registration failed",
            GprsRegistrationFail => "packet-domain registration failed",
            SignalLost => "radio signal lost",
            PreferredRadioTechChanged => "preferred radio technology changed",
            RadioPowerOff => "radio powered off",
            TetheredCallActive => "a tethered call is active",
            ErrorUnspecified => "unspecified radio error",
            Unknown => "unknown failure",
            RadioNotAvailable => "radio not available",
            UnacceptableNetworkParameter => "unacceptable network parameters",
            CompletionChannelBroken => "completion channel broken",
        };
        f.write_str(s)
    }
}
