//! simple-webrtc
//! A narrow view of a peer connection: just what offer/answer negotiation between two
//! room members needs. [`RtcPeer`] and [`PeerFactory`] are the seam; [`WrtcPeerFactory`]
//! implements them with [webrtc-rs](https://github.com/webrtc-rs/webrtc).
//!
//! Connection callbacks (local ICE candidates, remote tracks, ICE state) are reported as
//! [`events::PeerEvent`]s through the [`events::PeerContext`] the factory receives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use derive_more::Display;
use meshroom::{
    config::MeshConfig,
    media::MediaKind,
    room::IceState,
    signaling::{IceCandidate, SdpType, SessionDescription},
    sync::Mutex,
};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::host_media::LocalTrack;

use self::events::{PeerContext, RemoteTrack};

pub mod events;

/// Offer/answer progress as the connection itself sees it
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum SignalingState {
    #[display(fmt = "stable")]
    Stable,
    #[display(fmt = "have-local-offer")]
    HaveLocalOffer,
    #[display(fmt = "have-remote-offer")]
    HaveRemoteOffer,
    #[display(fmt = "closed")]
    Closed,
}

impl SignalingState {
    pub fn is_neutral(&self) -> bool {
        matches!(self, SignalingState::Stable)
    }
}

/// One negotiated connection to a remote participant
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Adds an outgoing track. Callers guarantee at most one track per kind.
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()>;

    /// Swaps the outgoing track of `kind` in place, without renegotiating
    async fn replace_track(&self, kind: MediaKind, track: Arc<LocalTrack>) -> Result<()>;

    /// The offer always asks to receive both audio and video
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer(&self, ctx: PeerContext) -> Result<Arc<dyn RtcPeer>>;
}

/// Builds webrtc-rs peer connections with the configured ICE servers
pub struct WrtcPeerFactory {
    api: webrtc::api::API,
    ice_servers: Vec<RTCIceServer>,
}

impl WrtcPeerFactory {
    pub fn new(config: &MeshConfig) -> Result<Self> {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        Ok(Self {
            api: create_api()?,
            ice_servers,
        })
    }
}

#[async_trait]
impl PeerFactory for WrtcPeerFactory {
    async fn create_peer(&self, ctx: PeerContext) -> Result<Arc<dyn RtcPeer>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .with_context(|| format!("failed to create peer connection for {}", ctx.remote))?,
        );

        // configure callbacks

        let dest = ctx.remote.clone();
        connection.on_peer_connection_state_change(Box::new(move |c: RTCPeerConnectionState| {
            log::info!("WebRTC connection state for peer {} has changed {}", &dest, c);
            Box::pin(futures::future::ready(()))
        }));

        let ctx2 = ctx.clone();
        connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            if let Some(candidate) = c {
                match candidate.to_json() {
                    Ok(init) => ctx2.ice_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(e) => log::error!("failed to serialize ice candidate for peer {}: {}", &ctx2.remote, e),
                }
            }
            Box::pin(futures::future::ready(()))
        }));

        let ctx2 = ctx.clone();
        connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            log::info!("ICE connection state for peer {} has changed {}", &ctx2.remote, state);
            if let Some(state) = ice_state(state) {
                ctx2.ice_state(state);
            }
            Box::pin(futures::future::ready(()))
        }));

        let ctx2 = ctx.clone();
        connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(MediaKind::Audio),
                    RTPCodecType::Video => Some(MediaKind::Video),
                    _ => None,
                };
                match kind {
                    Some(kind) => ctx2.track_added(RemoteTrack {
                        kind,
                        track: Some(track),
                    }),
                    None => log::warn!("ignoring track of unknown kind from peer {}", &ctx2.remote),
                }
                Box::pin(futures::future::ready(()))
            },
        ));

        Ok(Arc::new(WrtcPeer {
            connection,
            rtp_senders: Mutex::new(HashMap::new()),
            receive_only: Mutex::new(HashSet::new()),
        }))
    }
}

pub struct WrtcPeer {
    connection: Arc<RTCPeerConnection>,
    /// the sender is needed to swap tracks in place
    rtp_senders: Mutex<HashMap<MediaKind, RtcRtpManager>>,
    /// kinds for which a receive-only transceiver was added
    receive_only: Mutex<HashSet<MediaKind>>,
}

pub struct RtcRtpManager {
    sender: Arc<RTCRtpSender>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for RtcRtpManager {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[async_trait]
impl RtcPeer for WrtcPeer {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        let kind = track.kind();
        if self.rtp_senders.lock().contains_key(&kind) {
            bail!("duplicate {kind} track");
        }
        let rtp_sender = self.connection.add_track(track.rtc_track()).await?;

        // Read incoming RTCP packets
        // Before these packets are returned they are processed by interceptors. For things
        // like NACK this needs to be called.
        let sender2 = rtp_sender.clone();
        let handle = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender2.read(&mut rtcp_buf).await {}
            log::debug!("terminating rtp_sender thread for {kind} track");
        });
        self.rtp_senders.lock().insert(
            kind,
            RtcRtpManager {
                sender: rtp_sender,
                handle,
            },
        );
        Ok(())
    }

    async fn replace_track(&self, kind: MediaKind, track: Arc<LocalTrack>) -> Result<()> {
        let sender = match self.rtp_senders.lock().get(&kind) {
            Some(manager) => manager.sender.clone(),
            None => bail!("no {kind} sender to replace"),
        };
        sender.replace_track(Some(track.rtc_track())).await?;
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let sending = self.rtp_senders.lock().contains_key(&kind);
            if sending || !self.receive_only.lock().insert(kind) {
                continue;
            }
            let codec_type = match kind {
                MediaKind::Audio => RTPCodecType::Audio,
                MediaKind::Video => RTPCodecType::Video,
            };
            self.connection
                .add_transceiver_from_kind(
                    codec_type,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }

        let options = RTCOfferOptions {
            voice_activity_detection: false,
            ice_restart,
        };
        let offer = self.connection.create_offer(Some(options)).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        // Note: this will start the gathering of ICE candidates
        self.connection.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.connection.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.connection.signaling_state() {
            RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
        }
    }

    async fn close(&self) -> Result<()> {
        // dropping the managers stops the RTCP readers
        self.rtp_senders.lock().clear();
        self.connection.close().await?;
        Ok(())
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone())?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone())?,
    };
    Ok(rtc)
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    let state = match state {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => IceState::Connected,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    };
    Some(state)
}

fn create_api() -> Result<webrtc::api::API> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}
