// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Mail delivery for the `mail` action: multipart text + html + inline frame
//! over authenticated SMTPS.

use base::{err, Error};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::json::DetectionReport;

#[derive(Clone, Debug)]
pub struct MailConfig {
    pub server: String,
    /// Defaults to the SMTPS port (465).
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
    pub from: String,
    pub to: String,
    pub subject: String,
}

const INLINE_CID: &str = "frame";

fn summary(report: &DetectionReport) -> String {
    report
        .objects
        .iter()
        .map(|d| format!("{} ({}%)", d.class, (d.score * 100.0).round()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds and delivers the message. Blocking; run it off the async runtime.
pub fn send(cfg: &MailConfig, image: &[u8], report: &DetectionReport) -> Result<(), Error> {
    let msg = build(cfg, image, report)?;
    let mut builder = SmtpTransport::relay(&cfg.server)
        .map_err(|e| err!(InvalidArgument, msg("smtp relay {}", cfg.server), source(e)))?;
    if let Some(port) = cfg.port {
        builder = builder.port(port);
    }
    let transport = builder
        .credentials(Credentials::new(cfg.user.clone(), cfg.password.clone()))
        .build();
    transport
        .send(&msg)
        .map_err(|e| err!(Unavailable, msg("smtp send via {}", cfg.server), source(e)))?;
    Ok(())
}

fn build(cfg: &MailConfig, image: &[u8], report: &DetectionReport) -> Result<Message, Error> {
    let from: Mailbox = cfg
        .from
        .parse()
        .map_err(|e| err!(InvalidArgument, msg("mail_from {:?}", cfg.from), source(e)))?;
    let to: Mailbox = cfg
        .to
        .parse()
        .map_err(|e| err!(InvalidArgument, msg("mail_to {:?}", cfg.to), source(e)))?;
    let summary = summary(report);
    let text = format!("Detected: {summary}\n");
    let html = format!(
        "<html><body><p>Detected: {summary}</p>\
         <img src=\"cid:{INLINE_CID}\"/></body></html>"
    );
    let jpeg = ContentType::parse("image/jpeg").expect("static content type");
    Message::builder()
        .from(from)
        .to(to)
        .subject(cfg.subject.clone())
        .multipart(
            MultiPart::related()
                .multipart(
                    MultiPart::alternative()
                        .singlepart(SinglePart::plain(text))
                        .singlepart(SinglePart::html(html)),
                )
                .singlepart(Attachment::new_inline(INLINE_CID.to_owned()).body(image.to_vec(), jpeg)),
        )
        .map_err(|e| err!(InvalidArgument, msg("build mail"), source(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::{BBox, Detection};

    fn cfg() -> MailConfig {
        MailConfig {
            server: "smtp.example.com".to_owned(),
            port: None,
            user: "u".to_owned(),
            password: "p".to_owned(),
            from: "Vigil <vigil@example.com>".to_owned(),
            to: "ops@example.com".to_owned(),
            subject: "Vigil: object detected by cam0".to_owned(),
        }
    }

    #[test]
    fn builds_multipart_with_inline_image() {
        let report = DetectionReport::ok(vec![Detection {
            class: "person".to_owned(),
            score: 0.91,
            bbox: BBox([10, 20, 110, 220]),
            in_memory: false,
            cluster: None,
        }]);
        let msg = build(&cfg(), b"\xff\xd8fakejpeg", &report).unwrap();
        let raw = String::from_utf8_lossy(&msg.formatted()).into_owned();
        assert!(raw.contains("multipart/related"), "{raw}");
        assert!(raw.contains("person (91%)"), "{raw}");
        assert!(raw.contains("cid:frame"), "{raw}");
        assert!(raw.contains("image/jpeg"), "{raw}");
    }

    #[test]
    fn bad_address_is_rejected() {
        let mut c = cfg();
        c.to = "not an address".to_owned();
        let report = DetectionReport::ok(vec![]);
        assert!(build(&c, b"", &report).is_err());
    }
}
