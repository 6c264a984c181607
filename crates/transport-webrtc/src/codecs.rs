//! Codec registration for the media engine.
//!
//! Without preferences the engine gets webrtc-rs' default codec set. With a
//! preferred audio codec or an ordered list of video codecs, only those are
//! registered, so the offer/answer can carry nothing else.

use relay_session::Configuration;
use webrtc::api::media_engine::{
    MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU, MIME_TYPE_VP8, MIME_TYPE_VP9,
    MediaEngine,
};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

use crate::{WebRtcError, to_setup_error};

struct CodecSpec {
    name: &'static str,
    mime_type: &'static str,
    clock_rate: u32,
    channels: u16,
    fmtp: &'static str,
    payload_type: u8,
}

const AUDIO_CODECS: &[CodecSpec] = &[
    CodecSpec {
        name: "OPUS",
        mime_type: MIME_TYPE_OPUS,
        clock_rate: 48_000,
        channels: 2,
        fmtp: "minptime=10;useinbandfec=1",
        payload_type: 111,
    },
    CodecSpec {
        name: "PCMU",
        mime_type: MIME_TYPE_PCMU,
        clock_rate: 8_000,
        channels: 0,
        fmtp: "",
        payload_type: 0,
    },
    CodecSpec {
        name: "PCMA",
        mime_type: MIME_TYPE_PCMA,
        clock_rate: 8_000,
        channels: 0,
        fmtp: "",
        payload_type: 8,
    },
];

const VIDEO_CODECS: &[CodecSpec] = &[
    CodecSpec {
        name: "VP8",
        mime_type: MIME_TYPE_VP8,
        clock_rate: 90_000,
        channels: 0,
        fmtp: "",
        payload_type: 96,
    },
    CodecSpec {
        name: "VP9",
        mime_type: MIME_TYPE_VP9,
        clock_rate: 90_000,
        channels: 0,
        fmtp: "profile-id=0",
        payload_type: 98,
    },
    CodecSpec {
        name: "H264",
        mime_type: MIME_TYPE_H264,
        clock_rate: 90_000,
        channels: 0,
        fmtp: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        payload_type: 102,
    },
    CodecSpec {
        name: "AV1",
        mime_type: "video/AV1",
        clock_rate: 90_000,
        channels: 0,
        fmtp: "",
        payload_type: 41,
    },
];

fn lookup(table: &'static [CodecSpec], name: &str) -> Option<&'static CodecSpec> {
    table
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(name))
}

fn video_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        })
        .collect()
}

fn register(
    engine: &mut MediaEngine,
    spec: &CodecSpec,
    kind: RTPCodecType,
) -> Result<(), WebRtcError> {
    let rtcp_feedback = match kind {
        RTPCodecType::Video => video_feedback(),
        _ => Vec::new(),
    };
    engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: spec.mime_type.to_owned(),
                    clock_rate: spec.clock_rate,
                    channels: spec.channels,
                    sdp_fmtp_line: spec.fmtp.to_owned(),
                    rtcp_feedback,
                },
                payload_type: spec.payload_type,
                ..Default::default()
            },
            kind,
        )
        .map_err(to_setup_error)
}

/// Builds a media engine carrying the codecs `configuration` asks for.
pub fn media_engine(configuration: &Configuration) -> Result<MediaEngine, WebRtcError> {
    let mut engine = MediaEngine::default();
    if configuration.audio_codec().is_none() && configuration.video_codecs().is_empty() {
        engine.register_default_codecs().map_err(to_setup_error)?;
        return Ok(engine);
    }

    match configuration.audio_codec() {
        Some(name) => {
            let spec = lookup(AUDIO_CODECS, name)
                .ok_or_else(|| WebRtcError::UnsupportedCodec(name.to_string()))?;
            register(&mut engine, spec, RTPCodecType::Audio)?;
        }
        None => {
            for spec in AUDIO_CODECS {
                register(&mut engine, spec, RTPCodecType::Audio)?;
            }
        }
    }

    if configuration.video_codecs().is_empty() {
        for spec in VIDEO_CODECS.iter().take(3) {
            register(&mut engine, spec, RTPCodecType::Video)?;
        }
    } else {
        for name in configuration.video_codecs() {
            let spec = lookup(VIDEO_CODECS, name)
                .ok_or_else(|| WebRtcError::UnsupportedCodec(name.clone()))?;
            register(&mut engine, spec, RTPCodecType::Video)?;
        }
    }
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_names_match_case_insensitively() {
        assert_eq!(lookup(VIDEO_CODECS, "h264").map(|s| s.payload_type), Some(102));
        assert_eq!(lookup(AUDIO_CODECS, "opus").map(|s| s.clock_rate), Some(48_000));
        assert!(lookup(VIDEO_CODECS, "THEORA").is_none());
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let configuration = Configuration::builder()
            .video_codec("THEORA")
            .build()
            .expect("configuration");
        assert!(matches!(
            media_engine(&configuration),
            Err(WebRtcError::UnsupportedCodec(name)) if name == "THEORA"
        ));
    }

    #[test]
    fn preferred_codecs_build_an_engine() {
        let configuration = Configuration::builder()
            .audio_codec("PCMU")
            .video_codecs(["VP9", "VP8"])
            .build()
            .expect("configuration");
        assert!(media_engine(&configuration).is_ok());
    }
}
