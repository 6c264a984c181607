use std::collections::HashSet;

/// Track ids the remote side says it is sending in `sdp`.
///
/// A section counts when it carries an `a=msid` line and its direction lets
/// the remote send (`sendrecv`, `sendonly`, or no direction attribute).
/// Rejected sections (port 0) are skipped.
pub(crate) fn announced_tracks(sdp: &str) -> HashSet<String> {
    let mut announced = HashSet::new();
    let mut section: Option<Section> = None;
    for line in sdp.lines().map(str::trim_end) {
        if let Some(media) = line.strip_prefix("m=") {
            if let Some(done) = section.take() {
                done.collect(&mut announced);
            }
            let rejected = media.split_whitespace().nth(1) == Some("0");
            section = Some(Section {
                rejected,
                sending: true,
                tracks: Vec::new(),
            });
            continue;
        }
        let Some(current) = section.as_mut() else {
            continue;
        };
        match line {
            "a=recvonly" | "a=inactive" => current.sending = false,
            "a=sendrecv" | "a=sendonly" => current.sending = true,
            _ => {
                if let Some(track) = msid_track(line) {
                    current.tracks.push(track.to_string());
                }
            }
        }
    }
    if let Some(done) = section {
        done.collect(&mut announced);
    }
    announced
}

/// Track id from `a=msid:<stream> <track>` or the older
/// `a=ssrc:<ssrc> msid:<stream> <track>` form.
fn msid_track(line: &str) -> Option<&str> {
    let msid = match line.strip_prefix("a=msid:") {
        Some(msid) => msid,
        None => {
            let ssrc = line.strip_prefix("a=ssrc:")?;
            ssrc.split_once(" msid:")?.1
        }
    };
    msid.split_whitespace().nth(1)
}

struct Section {
    rejected: bool,
    sending: bool,
    tracks: Vec<String>,
}

impl Section {
    fn collect(self, into: &mut HashSet<String>) {
        if !self.rejected && self.sending {
            into.extend(self.tracks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_TRACKS: &str = "v=0\r\n\
        o=- 1 1 IN IP4 0.0.0.0\r\n\
        s=-\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=mid:0\r\n\
        a=sendrecv\r\n\
        a=msid:stream-a audio-a\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=mid:1\r\n\
        a=sendonly\r\n\
        a=msid:stream-a video-a\r\n";

    #[test]
    fn sending_sections_announce_their_tracks() {
        let tracks = announced_tracks(TWO_TRACKS);
        assert_eq!(tracks.len(), 2);
        assert!(tracks.contains("audio-a"));
        assert!(tracks.contains("video-a"));
    }

    #[test]
    fn inactive_and_rejected_sections_do_not_count() {
        let sdp = "v=0\r\n\
            m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
            a=inactive\r\n\
            a=msid:stream-a audio-a\r\n\
            m=video 0 UDP/TLS/RTP/SAVPF 96\r\n\
            a=msid:stream-a video-a\r\n\
            m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
            a=recvonly\r\n\
            a=msid:stream-b video-b\r\n";
        assert!(announced_tracks(sdp).is_empty());
    }

    #[test]
    fn ssrc_msid_lines_are_understood() {
        let sdp = "v=0\r\n\
            m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
            a=ssrc:1001 cname:relay\r\n\
            a=ssrc:1001 msid:conn-peer video-peer\r\n";
        let tracks = announced_tracks(sdp);
        assert_eq!(tracks.into_iter().collect::<Vec<_>>(), vec!["video-peer"]);
    }

    #[test]
    fn session_level_lines_are_ignored() {
        assert!(announced_tracks("v=0\r\na=msid:stray track\r\n").is_empty());
    }
}
