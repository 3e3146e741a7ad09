//! Counters for the dispatch layer.

tunnel_proto::define_stats! {
    /// Counters kept by a [`DispatchTable`](crate::DispatchTable).
    pub struct DispatchStats {
        /// Cells handled by a participant or inbound endpoint.
        dispatched_participant,
        /// Cells handled by an outbound endpoint.
        dispatched_endpoint,
        /// Messages injected at an inbound gateway.
        dispatched_inbound,
        /// Messages queued at one of our outbound gateways.
        dispatched_outbound,
        /// Messages for a tunnel id we have never heard of.
        unknown_tunnel,
        /// Messages for a tunnel that was removed moments ago.
        recently_expired_dropped,
        /// Messages refused for an out-of-range expiration.
        bad_expiration,
        /// Participating messages dropped by the shaper.
        participating_dropped,
        /// Messages refused at a tunnel exit by the safety filter.
        dangerous_dropped,
        /// Messages dropped because their next hop couldn't be found.
        lookup_failed,
        /// Endpoint messages refused by the new-router limit.
        obep_throttled,
    }
}

tunnel_proto::define_stats! {
    /// Counters shared by every gateway of one dispatcher.
    pub struct GatewayStats {
        /// Messages refused by a full inbound pre-queue.
        overflow_dropped,
        /// Messages that expired while queued.
        expired_dropped,
        /// Inbound-gateway messages dropped by the shaper.
        congestion_dropped,
    }
}
