//! Codec-preference rewriting of generated SDP.
//!
//! The rewrite only touches the first `m=audio` section: the payload list is
//! constrained to the preferred codecs in preference order, the per-payload
//! `rtpmap`/`fmtp`/`rtcp-fb` lines are regenerated after the remaining
//! attributes, and packetization parameters are injected. Applying it to its
//! own output is a no-op.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpRole {
    /// Locally generated offer. Payload types may be renumbered and missing
    /// preferred codecs appended.
    Offer,
    /// Answer to a remote offer. Payload types must echo the offer, so codecs
    /// are only reordered and constrained.
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSpec {
    pub name: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: Option<u16>,
    /// Payload type used when this side chooses the numbering.
    pub payload_type: u8,
    /// `key=value;key=value` parameters merged into the codec's fmtp line.
    #[serde(default)]
    pub fmtp: Option<String>,
}

impl CodecSpec {
    pub fn new(name: &str, clock_rate: u32, payload_type: u8) -> Self {
        Self {
            name: name.to_string(),
            clock_rate,
            channels: None,
            payload_type,
            fmtp: None,
        }
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_fmtp(mut self, fmtp: &str) -> Self {
        self.fmtp = Some(fmtp.to_string());
        self
    }

    fn encoding(&self) -> String {
        match self.channels {
            Some(ch) => format!("{}/{}/{}", self.name, self.clock_rate, ch),
            None => format!("{}/{}", self.name, self.clock_rate),
        }
    }

    fn matches(&self, map: &Rtpmap) -> bool {
        self.name.eq_ignore_ascii_case(&map.name)
            && self.clock_rate == map.clock_rate
            && self.channels.unwrap_or(1) == map.channels
    }
}

pub const OPUS_FMTP: &str =
    "maxaveragebitrate=20000;maxplaybackrate=16000;minptime=20;sprop-maxcapturerate=16000;useinbandfec=1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecPreferences {
    pub codecs: Vec<CodecSpec>,
    #[serde(default)]
    pub ptime: Option<u32>,
}

impl Default for CodecPreferences {
    /// Narrowband first, then Opus, then DTMF events.
    fn default() -> Self {
        Self {
            codecs: vec![
                CodecSpec::new("PCMU", 8000, 0),
                CodecSpec::new("PCMA", 8000, 8),
                CodecSpec::new("opus", 48000, 111)
                    .with_channels(2)
                    .with_fmtp(OPUS_FMTP),
                CodecSpec::new("telephone-event", 8000, 101),
            ],
            ptime: Some(20),
        }
    }
}

impl CodecPreferences {
    /// Opus first, as the WhatsApp Business SIP gateway expects.
    pub fn whatsapp_business() -> Self {
        let mut prefs = Self::default();
        let opus = prefs.codecs.remove(2);
        prefs.codecs.insert(0, opus);
        prefs
    }

    /// First payload type pinned by more than one codec, if any.
    pub fn duplicate_payload_type(&self) -> Option<u8> {
        let mut seen = Vec::with_capacity(self.codecs.len());
        for codec in &self.codecs {
            if seen.contains(&codec.payload_type) {
                return Some(codec.payload_type);
            }
            seen.push(codec.payload_type);
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rtpmap {
    /// As written after the payload type, e.g. `opus/48000/2`.
    encoding: String,
    name: String,
    clock_rate: u32,
    channels: u16,
}

impl Rtpmap {
    fn parse(encoding: &str) -> Option<Self> {
        let encoding = encoding.trim();
        let mut parts = encoding.split('/');
        let name = parts.next()?.to_string();
        let clock_rate = parts.next()?.parse().ok()?;
        let channels = match parts.next() {
            Some(ch) => ch.parse().ok()?,
            None => 1,
        };
        Some(Self {
            encoding: encoding.to_string(),
            name,
            clock_rate,
            channels,
        })
    }
}

/// Static payload types that may appear without an rtpmap line.
fn static_rtpmap(pt: u8) -> Option<Rtpmap> {
    let encoding = match pt {
        0 => "PCMU/8000",
        3 => "GSM/8000",
        4 => "G723/8000",
        8 => "PCMA/8000",
        9 => "G722/8000",
        18 => "G729/8000",
        _ => return None,
    };
    Rtpmap::parse(encoding)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PayloadAttr {
    Rtpmap,
    Fmtp,
    RtcpFb,
}

fn payload_attribute(line: &str) -> Option<(PayloadAttr, u8, &str)> {
    let (attr, rest) = [
        (PayloadAttr::Rtpmap, "a=rtpmap:"),
        (PayloadAttr::Fmtp, "a=fmtp:"),
        (PayloadAttr::RtcpFb, "a=rtcp-fb:"),
    ]
    .into_iter()
    .find_map(|(attr, prefix)| line.strip_prefix(prefix).map(|rest| (attr, rest)))?;
    let (pt, value) = rest.split_once(' ')?;
    Some((attr, pt.parse().ok()?, value))
}

fn parse_params(params: &str) -> Vec<(String, Option<String>)> {
    params
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
            None => (p.to_string(), None),
        })
        .collect()
}

/// Existing parameters keep their position; preferred values override them
/// and new keys are appended in preference order.
fn merge_fmtp(existing: Option<&str>, preferred: Option<&str>) -> Option<String> {
    let mut merged = existing.map(parse_params).unwrap_or_default();
    for (key, value) in preferred.map(parse_params).unwrap_or_default() {
        match merged.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => merged.push((key, value)),
        }
    }
    if merged.is_empty() {
        return None;
    }
    Some(
        merged
            .into_iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{k}={v}"),
                None => k,
            })
            .collect::<Vec<_>>()
            .join(";"),
    )
}

struct Selected<'a> {
    spec: &'a CodecSpec,
    original: Option<u8>,
    current: Option<u8>,
}

/// Moves codecs onto their pinned payload types wherever the target is free,
/// repeating until nothing moves. The result is a fixed point, so a second
/// rewrite assigns the same numbers.
fn assign_payload_types(entries: &mut [Selected<'_>]) {
    loop {
        let mut changed = false;
        for i in 0..entries.len() {
            let desired = entries[i].spec.payload_type;
            if entries[i].current == Some(desired) {
                continue;
            }
            let occupied = entries
                .iter()
                .enumerate()
                .any(|(j, e)| j != i && e.current == Some(desired));
            if !occupied {
                entries[i].current = Some(desired);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn rewrite_audio_section(
    section: &[&str],
    prefs: &CodecPreferences,
    role: SdpRole,
) -> Option<Vec<String>> {
    let fields: Vec<&str> = section[0].split(' ').collect();
    if fields.len() < 3 {
        return None;
    }
    let offered: Vec<u8> = fields[3..].iter().filter_map(|p| p.parse().ok()).collect();

    let mut rtpmaps: HashMap<u8, Rtpmap> = HashMap::new();
    let mut fmtps: HashMap<u8, &str> = HashMap::new();
    let mut feedback: HashMap<u8, Vec<&str>> = HashMap::new();
    let mut ptime_line = None;
    let mut others = Vec::new();

    for line in &section[1..] {
        if let Some((attr, pt, value)) = payload_attribute(line) {
            match attr {
                PayloadAttr::Rtpmap => {
                    if let Some(map) = Rtpmap::parse(value) {
                        rtpmaps.insert(pt, map);
                    }
                }
                PayloadAttr::Fmtp => {
                    fmtps.insert(pt, value);
                }
                PayloadAttr::RtcpFb => feedback.entry(pt).or_default().push(value),
            }
            continue;
        }
        if line.starts_with("a=ptime:") {
            ptime_line = Some(*line);
            continue;
        }
        others.push(*line);
    }

    let rtpmap_for = |pt: u8| rtpmaps.get(&pt).cloned().or_else(|| static_rtpmap(pt));

    let mut selected: Vec<Selected<'_>> = Vec::new();
    for spec in &prefs.codecs {
        let found = offered.iter().copied().find(|pt| {
            rtpmap_for(*pt).is_some_and(|map| spec.matches(&map))
                && !selected.iter().any(|s| s.original == Some(*pt))
        });
        match (found, role) {
            (Some(pt), _) => selected.push(Selected {
                spec,
                original: Some(pt),
                current: Some(pt),
            }),
            (None, SdpRole::Offer) => selected.push(Selected {
                spec,
                original: None,
                current: None,
            }),
            (None, SdpRole::Answer) => {}
        }
    }

    if selected.iter().all(|s| s.original.is_none()) {
        debug!("No preferred codec in audio section, leaving SDP untouched");
        return None;
    }

    if role == SdpRole::Offer {
        assign_payload_types(&mut selected);
    }

    let mut out = Vec::with_capacity(section.len());
    let payloads: Vec<String> = selected
        .iter()
        .filter_map(|s| s.current.map(|pt| pt.to_string()))
        .collect();
    out.push(format!("{} {}", fields[..3].join(" "), payloads.join(" ")));
    out.extend(others.iter().map(|l| l.to_string()));

    for entry in &selected {
        let Some(pt) = entry.current else { continue };
        let encoding = entry
            .original
            .and_then(|o| rtpmaps.get(&o))
            .map(|m| m.encoding.clone())
            .unwrap_or_else(|| entry.spec.encoding());
        out.push(format!("a=rtpmap:{pt} {encoding}"));

        let existing = entry.original.and_then(|o| fmtps.get(&o).copied());
        if let Some(params) = merge_fmtp(existing, entry.spec.fmtp.as_deref()) {
            out.push(format!("a=fmtp:{pt} {params}"));
        }
        if let Some(lines) = entry.original.and_then(|o| feedback.get(&o)) {
            out.extend(lines.iter().map(|fb| format!("a=rtcp-fb:{pt} {fb}")));
        }
    }

    match (prefs.ptime, ptime_line) {
        (Some(ptime), _) => out.push(format!("a=ptime:{ptime}")),
        (None, Some(line)) => out.push(line.to_string()),
        (None, None) => {}
    }

    Some(out)
}

/// Applies codec preferences to the audio section of `sdp`.
///
/// Line endings follow the input (`\r\n` if present anywhere, `\n`
/// otherwise). SDP without an audio section, or whose audio section carries
/// none of the preferred codecs, is returned unchanged.
pub fn rewrite_sdp(sdp: &str, prefs: &CodecPreferences, role: SdpRole) -> String {
    let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = sdp.lines().collect();

    let Some(start) = lines.iter().position(|l| l.starts_with("m=audio ")) else {
        return sdp.to_string();
    };
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map_or(lines.len(), |i| start + 1 + i);

    let Some(section) = rewrite_audio_section(&lines[start..end], prefs, role) else {
        return sdp.to_string();
    };

    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 4);
    out.extend_from_slice(&lines[..start]);
    out.extend(section.iter().map(String::as_str));
    out.extend_from_slice(&lines[end..]);

    let mut result = out.join(eol);
    if sdp.ends_with('\n') {
        result.push_str(eol);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSER_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 63 103 9 0 8 13 126\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtcp:9 IN IP4 0.0.0.0\r\n\
a=ice-ufrag:khLS\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtpmap:63 opus/48000/2\r\n\
a=rtcp-fb:63 transport-cc\r\n\
a=fmtp:63 minptime=10;useinbandfec=1\r\n\
a=rtpmap:103 ISAC/16000\r\n\
a=rtpmap:9 G722/8000\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:13 CN/8000\r\n\
a=rtpmap:126 telephone-event/8000\r\n\
a=ssrc:1001 cname:abc\r\n";

    #[test]
    fn test_offer_is_constrained_and_renumbered() {
        let out = rewrite_sdp(
            BROWSER_OFFER,
            &CodecPreferences::whatsapp_business(),
            SdpRole::Offer,
        );

        assert!(out.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 0 8 101\r\n"));
        assert!(out.contains("a=rtpmap:111 opus/48000/2\r\n"));
        assert!(out.contains("a=rtcp-fb:111 transport-cc\r\n"));
        assert!(out.contains(
            "a=fmtp:111 minptime=20;useinbandfec=1;maxaveragebitrate=20000;maxplaybackrate=16000;sprop-maxcapturerate=16000\r\n"
        ));
        assert!(out.contains("a=rtpmap:101 telephone-event/8000\r\n"));
        assert!(!out.contains("ISAC"));
        assert!(!out.contains("a=rtpmap:63"));
        assert!(!out.contains("a=rtpmap:13"));
        assert!(out.ends_with("a=ptime:20\r\n"));
        // Non-codec attributes survive in order.
        assert!(out.contains("a=mid:0\r\na=sendrecv\r\na=ssrc:1001 cname:abc\r\n"));
        assert!(!out.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        for prefs in [
            CodecPreferences::default(),
            CodecPreferences::whatsapp_business(),
        ] {
            for role in [SdpRole::Offer, SdpRole::Answer] {
                let once = rewrite_sdp(BROWSER_OFFER, &prefs, role);
                let twice = rewrite_sdp(&once, &prefs, role);
                assert_eq!(once, twice);
            }
        }
    }

    #[test]
    fn test_answer_keeps_payload_numbers() {
        let answer = "v=0\n\
m=audio 9 UDP/TLS/RTP/SAVPF 63 0 126\n\
a=mid:0\n\
a=rtpmap:63 opus/48000/2\n\
a=fmtp:63 minptime=10\n\
a=rtpmap:126 telephone-event/8000\n";

        let out = rewrite_sdp(answer, &CodecPreferences::default(), SdpRole::Answer);
        assert!(out.contains("m=audio 9 UDP/TLS/RTP/SAVPF 0 63 126\n"));
        assert!(out.contains("a=rtpmap:0 PCMU/8000\n"));
        assert!(out.contains("a=rtpmap:63 opus/48000/2\n"));
        assert!(!out.contains("a=rtpmap:8 "));
        assert!(!out.contains("\r\n"));
    }

    #[test]
    fn test_offer_adds_missing_static_codecs() {
        let offer = "v=0\r\nm=audio 9 RTP/AVP 111\r\na=rtpmap:111 opus/48000/2\r\n";
        let out = rewrite_sdp(offer, &CodecPreferences::default(), SdpRole::Offer);

        assert!(out.contains("m=audio 9 RTP/AVP 0 8 111 101\r\n"));
        assert!(out.contains("a=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\n"));
        assert!(out.contains("a=rtpmap:101 telephone-event/8000\r\n"));
    }

    #[test]
    fn test_sdp_without_audio_is_untouched() {
        let video = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n";
        assert_eq!(
            rewrite_sdp(video, &CodecPreferences::default(), SdpRole::Offer),
            video
        );

        let unknown_only = "v=0\nm=audio 9 RTP/AVP 103\na=rtpmap:103 ISAC/16000\n";
        assert_eq!(
            rewrite_sdp(unknown_only, &CodecPreferences::default(), SdpRole::Offer),
            unknown_only
        );
    }

    #[test]
    fn test_only_first_audio_section_is_rewritten() {
        let sdp = "v=0\nm=audio 9 RTP/AVP 0 8\na=rtpmap:0 PCMU/8000\nm=video 9 RTP/AVP 96\na=rtpmap:96 VP8/90000\na=ptime:40\n";
        let out = rewrite_sdp(sdp, &CodecPreferences::default(), SdpRole::Answer);
        assert!(out.ends_with("m=video 9 RTP/AVP 96\na=rtpmap:96 VP8/90000\na=ptime:40\n"));
    }

    #[test]
    fn test_whatsapp_preset_order() {
        let prefs = CodecPreferences::whatsapp_business();
        let names: Vec<_> = prefs.codecs.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["opus", "PCMU", "PCMA", "telephone-event"]);
        assert_eq!(prefs.duplicate_payload_type(), None);

        let mut dup = prefs.clone();
        dup.codecs[3].payload_type = 0;
        assert_eq!(dup.duplicate_payload_type(), Some(0));
    }
}
