#![forbid(unsafe_code)]

// mediasoup worker, router and transport settings

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

/// Settings for the mediasoup-backed engine
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub announced_ip: Option<IpAddr>,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            announced_ip: None,
            initial_available_outgoing_bitrate: 600_000,
        }
    }
}

impl MediaConfig {
    pub fn with_announced_ip(mut self, ip: IpAddr) -> Self {
        self.announced_ip = Some(ip);
        self
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.log_level;
        settings.log_tags = vec![
            WorkerLogTag::Info,
            WorkerLogTag::Ice,
            WorkerLogTag::Dtls,
            WorkerLogTag::Rtp,
            WorkerLogTag::Rtcp,
        ];
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions::new(media_codecs())
    }

    pub fn transport_options(&self) -> WebRtcTransportOptions {
        let listen_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            announced_address: self.announced_ip.map(|ip| ip.to_string()),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };
        let mut options = WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(listen_info));
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        options
    }
}

/// Opus for audio; VP8 and H264 for video
fn media_codecs() -> Vec<RtpCodecCapability> {
    let video_feedback = || {
        vec![
            RtcpFeedback::Nack,
            RtcpFeedback::NackPli,
            RtcpFeedback::CcmFir,
            RtcpFeedback::GoogRemb,
            RtcpFeedback::TransportCc,
        ]
    };

    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(111),
            clock_rate: NonZeroU32::MIN.saturating_add(47_999),
            channels: NonZeroU8::MIN.saturating_add(1),
            parameters: RtpCodecParametersParameters::from([
                ("minptime", 10_u32.into()),
                ("useinbandfec", 1_u32.into()),
            ]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: Some(96),
            clock_rate: NonZeroU32::MIN.saturating_add(89_999),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: video_feedback(),
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: Some(102),
            clock_rate: NonZeroU32::MIN.saturating_add(89_999),
            parameters: RtpCodecParametersParameters::from([
                ("level-asymmetry-allowed", 1_u32.into()),
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
            ]),
            rtcp_feedback: video_feedback(),
        },
    ]
}
