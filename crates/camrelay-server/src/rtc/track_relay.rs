//! Track relay for RTP forwarding
//!
//! Reads RTP packets from a publisher's inbound track and writes them to every
//! live view. Uses TrackLocalStaticRTP for direct forwarding so the
//! publisher's packetization reaches the viewer untouched.

use anyhow::{Result, bail};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use super::MediaSource;

const MAX_CONSECUTIVE_READ_ERRORS: u32 = 50;
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);
const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

/// Fans one inbound track out to any number of independently droppable views
pub struct TrackRelay {
    id: String,
    source_track: Arc<TrackRemote>,
    /// Publisher connection, used to request keyframes
    publisher: Weak<RTCPeerConnection>,
    views: Mutex<HashMap<Uuid, Arc<TrackLocalStaticRTP>>>,
    ended: watch::Sender<bool>,
}

impl TrackRelay {
    /// Start relaying a source track. Forwarding runs until the track closes.
    pub fn spawn(source_track: Arc<TrackRemote>, publisher: Weak<RTCPeerConnection>) -> Arc<Self> {
        let (ended, _) = watch::channel(false);
        let relay = Arc::new(Self {
            id: format!("{}-{}", source_track.stream_id(), source_track.id()),
            source_track,
            publisher,
            views: Mutex::new(HashMap::new()),
            ended,
        });

        tokio::spawn(relay.clone().forward());
        tokio::spawn(Self::request_keyframes(Arc::downgrade(&relay)));

        relay
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        !*self.ended.borrow()
    }

    pub fn view_count(&self) -> usize {
        self.views.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Resolves once the source track has stopped producing packets
    pub async fn closed(&self) {
        let mut ended = self.ended.subscribe();
        let _ = ended.wait_for(|ended| *ended).await;
    }

    /// Codec the publisher negotiated for this track, fmtp line included
    pub fn codec_capability(&self) -> RTCRtpCodecCapability {
        self.source_track.codec().capability
    }

    /// Create a new view onto this source, sending with `capability`
    ///
    /// `capability` must be one the viewer's media engine registered, or the
    /// viewer's `add_track` finds no codec.
    pub fn add_view(self: &Arc<Self>, capability: RTCRtpCodecCapability) -> Result<RelayView> {
        if !self.is_active() {
            bail!("relay {} has ended", self.id);
        }

        let view_id = Uuid::new_v4();
        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            format!("{}-{}", self.source_track.id(), view_id),
            format!("camrelay-{}", self.id),
        ));

        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(view_id, track.clone());

        tracing::info!(relay = %self.id, view = %view_id, "Added relay view");

        self.request_keyframe();

        Ok(RelayView {
            handle: Arc::new(ViewHandle {
                id: view_id,
                track,
                relay: Arc::downgrade(self),
            }),
        })
    }

    fn detach(&self, view_id: Uuid) {
        let removed = self
            .views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&view_id)
            .is_some();

        if removed {
            tracing::info!(relay = %self.id, view = %view_id, "Removed relay view");
        }
    }

    async fn forward(self: Arc<Self>) {
        tracing::info!(
            relay = %self.id,
            kind = ?self.source_track.kind(),
            "Starting RTP forwarding"
        );

        let mut packet_count = 0u64;
        let mut consecutive_errors = 0u32;

        loop {
            match self.source_track.read_rtp().await {
                Ok((rtp_packet, _attributes)) => {
                    consecutive_errors = 0;
                    packet_count += 1;
                    self.forward_packet(&rtp_packet, packet_count).await;
                }
                Err(e) => {
                    let error_msg = e.to_string();

                    if error_msg.contains("closed") || error_msg.contains("EOF") {
                        tracing::info!(relay = %self.id, packets = packet_count, "Source track closed");
                        break;
                    }

                    consecutive_errors += 1;
                    if consecutive_errors > MAX_CONSECUTIVE_READ_ERRORS {
                        tracing::error!(
                            relay = %self.id,
                            error = %e,
                            "Giving up on source track after repeated read errors"
                        );
                        break;
                    }
                    if consecutive_errors == 1 {
                        tracing::warn!(relay = %self.id, error = %e, "Error reading RTP from source track");
                    }

                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
            }
        }

        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.ended.send_replace(true);
    }

    async fn forward_packet(&self, rtp_packet: &webrtc::rtp::packet::Packet, packet_count: u64) {
        // Snapshot so a view dropped mid-write never blocks on the map
        let views: Vec<(Uuid, Arc<TrackLocalStaticRTP>)> = self
            .views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, track)| (*id, track.clone()))
            .collect();

        for (view_id, local_track) in &views {
            if let Err(e) = local_track.write_rtp(rtp_packet).await {
                tracing::debug!(relay = %self.id, view = %view_id, error = %e, "Failed to forward RTP");
            }
        }

        if packet_count % 1000 == 1 {
            tracing::debug!(
                relay = %self.id,
                packets = packet_count,
                views = views.len(),
                seq = rtp_packet.header.sequence_number,
                "Forwarding RTP"
            );
        }
    }

    /// Ask the publisher for a keyframe so a new view can start decoding
    fn request_keyframe(&self) {
        let Some(publisher) = self.publisher.upgrade() else {
            return;
        };
        let media_ssrc = self.source_track.ssrc();
        let relay_id = self.id.clone();

        tokio::spawn(async move {
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            if let Err(e) = publisher.write_rtcp(&[Box::new(pli)]).await {
                tracing::debug!(relay = %relay_id, error = %e, "Failed to request keyframe");
            }
        });
    }

    async fn request_keyframes(relay: Weak<Self>) {
        let mut ticker = tokio::time::interval(KEYFRAME_INTERVAL);
        loop {
            ticker.tick().await;

            let Some(relay) = relay.upgrade() else {
                return;
            };
            if !relay.is_active() {
                return;
            }
            if relay.view_count() > 0 {
                relay.request_keyframe();
            }
        }
    }
}

impl MediaSource for Arc<TrackRelay> {
    fn source_id(&self) -> &str {
        &self.id
    }
}

/// A single viewer's handle onto a relay
///
/// Clones share one registration; dropping the last clone stops forwarding
/// to this view.
#[derive(Clone)]
pub struct RelayView {
    handle: Arc<ViewHandle>,
}

impl RelayView {
    pub fn id(&self) -> Uuid {
        self.handle.id
    }

    pub fn track(&self) -> Arc<TrackLocalStaticRTP> {
        self.handle.track.clone()
    }
}

struct ViewHandle {
    id: Uuid,
    track: Arc<TrackLocalStaticRTP>,
    relay: Weak<TrackRelay>,
}

impl Drop for ViewHandle {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.upgrade() {
            relay.detach(self.id);
        }
    }
}
