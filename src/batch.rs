//! Expands a campaign into per-recipient mails and dispatches them one by one,
//! behind an abort countdown and with periodic cooldown pauses.

use crate::config::{Campaign, Pacing, Recipient};
use crate::email_sender::template::EmailTemplate;
use crate::email_sender::{message, Deliver, EmailError, Mail};
use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Email(#[from] EmailError),

    #[error("Failed to store message in \"{dir}\": {source}")]
    Archive { dir: String, source: io::Error },

    #[error("Failed to write transcript: {0}")]
    Output(#[from] io::Error),
}

/// Builds one [`Mail`] per recipient, in recipient order.
///
/// Campaign Bcc is not copied into the mails.
pub fn expand(
    campaign: &Campaign,
    recipients: &[Recipient],
    template: &EmailTemplate,
) -> Result<Vec<Mail>, EmailError> {
    if !campaign.bcc.is_empty() {
        log::warn!(
            "task Bcc ({}) is listed in the summary only and not added to recipient envelopes",
            campaign.bcc.join(", ")
        );
    }

    recipients
        .iter()
        .map(|recipient| {
            Ok(Mail {
                sender: campaign.sender.clone(),
                to: vec![recipient.email.clone()],
                cc: campaign.cc.clone(),
                bcc: Vec::new(),
                reply_to: campaign.reply_to.clone(),
                subject: campaign.subject.clone(),
                text: template.render(&recipient.template_variables())?,
                charset: campaign.charset.clone(),
                attachments: recipient
                    .attachments
                    .iter()
                    .chain(&campaign.attachments)
                    .cloned()
                    .collect(),
            })
        })
        .collect()
}

/// The operator-facing waits of a run.
#[async_trait]
pub trait Pacer: Send {
    /// Last chance to abort before anything is sent.
    async fn countdown(&mut self, seconds: u64) -> io::Result<()>;
    /// Let the SMTP server recover.
    async fn cooldown(&mut self, minutes: u32) -> io::Result<()>;
}

/// Sleeps for real and keeps a single live counter line on stdout.
pub struct ConsolePacer;

impl ConsolePacer {
    async fn tick(label: fn(u64) -> String, from: u64, step: Duration) -> io::Result<()> {
        let mut stdout = io::stdout();
        for remaining in (1..=from).rev() {
            write!(stdout, "\x1b[2K\r{}", label(remaining))?;
            stdout.flush()?;
            tokio::time::sleep(step).await;
        }
        write!(stdout, "\x1b[2K\r{}\n\n", label(0))?;
        stdout.flush()
    }
}

#[async_trait]
impl Pacer for ConsolePacer {
    async fn countdown(&mut self, seconds: u64) -> io::Result<()> {
        Self::tick(
            |s| format!("Safety Countdown: {s}"),
            seconds,
            Duration::from_secs(1),
        )
        .await
    }

    async fn cooldown(&mut self, minutes: u32) -> io::Result<()> {
        Self::tick(
            |m| format!("Remaining in recovery phase for {m} minutes"),
            u64::from(minutes),
            Duration::from_secs(60),
        )
        .await
    }
}

/// Numbered `.eml` files in one directory. Existing files are never touched:
/// the next free index is taken.
#[derive(Debug)]
pub struct EmlArchive {
    dir: PathBuf,
    next: usize,
}

impl EmlArchive {
    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(EmlArchive {
            dir: dir.to_path_buf(),
            next: 0,
        })
    }

    pub fn store(&mut self, bytes: &[u8]) -> io::Result<PathBuf> {
        loop {
            let path = self.dir.join(format!("{}.eml", self.next));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(bytes)?;
                    self.next += 1;
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => self.next += 1,
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct Options {
    pub dry_run: bool,
    pub archive: Option<EmlArchive>,
    pub pacing: Pacing,
}

pub struct Batch<'a, W> {
    deliverer: &'a dyn Deliver,
    pacer: &'a mut dyn Pacer,
    out: W,
    options: Options,
}

impl<'a, W: Write> Batch<'a, W> {
    pub fn new(
        deliverer: &'a dyn Deliver,
        pacer: &'a mut dyn Pacer,
        out: W,
        options: Options,
    ) -> Self {
        Batch {
            deliverer,
            pacer,
            out,
            options,
        }
    }

    /// Sends (or, in dry-run, prints) every mail in order. The first error
    /// stops the run; nothing already sent is undone.
    ///
    /// Returns the number of processed mails.
    pub async fn run(&mut self, campaign: &Campaign, mails: &[Mail]) -> Result<usize, BatchError> {
        let dry_run = self.options.dry_run;
        let Pacing {
            cooldown,
            countdown,
        } = self.options.pacing;

        if !dry_run {
            self.print_summary(campaign, mails)?;
            self.pacer.countdown(countdown).await?;
        }

        writeln!(self.out, "Fire!")?;
        let total = mails.len();

        for (i, mail) in mails.iter().enumerate() {
            let recipients = mail.envelope_recipients()?;
            let rendered = message::build(mail)?;

            if let Some(archive) = self.options.archive.as_mut() {
                let path = archive
                    .store(rendered.as_bytes())
                    .map_err(|source| BatchError::Archive {
                        dir: archive.dir.display().to_string(),
                        source,
                    })?;
                log::debug!("Stored message for {} in \"{}\"", recipients.join(","), path.display());
            }

            if dry_run {
                writeln!(self.out, "{}", String::from_utf8_lossy(rendered.as_bytes()))?;
                log::debug!("dryrun: not sending mail to {}", recipients.join(","));
                writeln!(self.out, "> {} of {} mails NOT sent (dry-run)", i + 1, total)?;
                continue;
            }

            self.deliverer
                .deliver(&rendered, &mail.sender, &recipients)
                .await?;
            writeln!(self.out, "> {} of {} mails sent", i + 1, total)?;

            let sent = i + 1;
            // no pause after the final message
            if cooldown > 0 && sent % cooldown as usize == 0 && sent < total {
                writeln!(
                    self.out,
                    "\nAutomatic cooldown for {cooldown} minutes to let smtp server recover.\n"
                )?;
                self.out.flush()?;
                self.pacer.cooldown(cooldown).await?;
                writeln!(self.out, "Fire!")?;
            }
        }

        Ok(total)
    }

    fn print_summary(&mut self, campaign: &Campaign, mails: &[Mail]) -> io::Result<()> {
        let addresses: usize = mails
            .iter()
            .map(|m| m.to.len() + m.cc.len() + m.bcc.len())
            .sum();
        let out = &mut self.out;

        writeln!(
            out,
            "\nWARNING: You are going to automatically send {} mail(s) to {} address(es):\n",
            mails.len(),
            addresses
        )?;
        writeln!(out, "         Subject: \"{}\"\n", campaign.subject)?;
        writeln!(out, "         From: \"{}\"", campaign.sender)?;
        writeln!(out, "         Reply-To: \"{}\"", campaign.reply_to)?;
        writeln!(out, "         Cc: \"{}\"", campaign.cc.join(", "))?;
        writeln!(out, "         Bcc: \"{}\"", campaign.bcc.join(", "))?;
        writeln!(out, "         Global attachments: {}", campaign.attachments.len())?;
        writeln!(out, "         To: \"{}\"", campaign.recipient_file.display())?;
        writeln!(out, "         Text: \"{}\"\n", campaign.body_template.display())?;
        writeln!(
            out,
            "If you made ANY mistake, {addresses} people will be angry at you.\n"
        )?;
        writeln!(
            out,
            "We will give you a countdown from {} seconds to reconsider.\n",
            self.options.pacing.countdown
        )?;
        writeln!(out, "This is your last chance to cancel. Press Ctrl-C to cancel.\n")?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Attachment, Variable};
    use crate::email_sender::message::RenderedMessage;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Countdown(u64),
        Sent(Vec<String>),
        Cooldown(u32),
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    struct RecordingDeliverer {
        events: Events,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl Deliver for RecordingDeliverer {
        async fn deliver(
            &self,
            message: &RenderedMessage,
            _from: &str,
            recipients: &[&str],
        ) -> Result<(), EmailError> {
            assert!(!message.as_bytes().is_empty());
            let mut events = self.events.lock().unwrap();
            let attempt = events
                .iter()
                .filter(|e| matches!(e, Event::Sent(_)))
                .count()
                + 1;
            if self.fail_on == Some(attempt) {
                return Err(EmailError::ConfigError("connection refused".into()));
            }
            events.push(Event::Sent(recipients.iter().map(|r| r.to_string()).collect()));
            Ok(())
        }
    }

    struct RecordingPacer {
        events: Events,
    }

    #[async_trait]
    impl Pacer for RecordingPacer {
        async fn countdown(&mut self, seconds: u64) -> io::Result<()> {
            self.events.lock().unwrap().push(Event::Countdown(seconds));
            Ok(())
        }

        async fn cooldown(&mut self, minutes: u32) -> io::Result<()> {
            self.events.lock().unwrap().push(Event::Cooldown(minutes));
            Ok(())
        }
    }

    /// A terminal that went away.
    struct ClosedPacer;

    #[async_trait]
    impl Pacer for ClosedPacer {
        async fn countdown(&mut self, _seconds: u64) -> io::Result<()> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        async fn cooldown(&mut self, _minutes: u32) -> io::Result<()> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
    }

    fn campaign(attachments: Vec<Attachment>) -> Campaign {
        Campaign {
            name: "test".into(),
            subject: "Hello".into(),
            sender: "Sender <sender@example.org>".into(),
            reply_to: "reply@example.org".into(),
            cc: vec!["cc@example.org".into()],
            bcc: vec!["secret@example.org".into()],
            attachments,
            ..Default::default()
        }
    }

    fn recipient(email: &str, name: &str) -> Recipient {
        Recipient {
            email: email.into(),
            variables: vec![Variable {
                name: "%NAME%".into(),
                value: name.into(),
            }],
            ..Default::default()
        }
    }

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| recipient(&format!("r{i}@example.org"), &format!("R{i}")))
            .collect()
    }

    fn options(dry_run: bool, cooldown: u32) -> Options {
        Options {
            dry_run,
            archive: None,
            pacing: Pacing {
                cooldown,
                countdown: 30,
            },
        }
    }

    fn sent_to(email: &str) -> Event {
        Event::Sent(vec![email.to_string(), "cc@example.org".to_string()])
    }

    #[test]
    fn expansion_builds_one_mail_per_recipient() {
        let dir = TempDir::new().unwrap();
        let global = dir.path().join("global.pdf");
        let personal = dir.path().join("personal.pdf");
        fs::write(&global, "g").unwrap();
        fs::write(&personal, "p").unwrap();

        let campaign = campaign(vec![Attachment {
            path: global.clone(),
            content_type: "application/pdf".into(),
            charset: String::new(),
        }]);
        let mut ann = recipient("ann@example.org", "Ann");
        ann.attachments.push(Attachment {
            path: personal.clone(),
            content_type: "application/pdf".into(),
            charset: String::new(),
        });
        let template = EmailTemplate::from_content("Dear %NAME%");

        let mails = expand(&campaign, &[ann, recipient("bob@example.org", "Bob")], &template).unwrap();

        assert_eq!(mails.len(), 2);
        assert_eq!(mails[0].to, ["ann@example.org"]);
        assert_eq!(mails[0].cc, ["cc@example.org"]);
        assert!(mails[0].bcc.is_empty());
        assert_eq!(mails[0].text, "Dear Ann");
        assert_eq!(mails[1].text, "Dear Bob");
        assert_eq!(mails[0].reply_to, "reply@example.org");
        let paths: Vec<&Path> = mails[0].attachments.iter().map(|a| a.path.as_path()).collect();
        assert_eq!(paths, [personal.as_path(), global.as_path()]);
        assert_eq!(mails[1].attachments.len(), 1);
    }

    #[tokio::test]
    async fn cooldown_after_every_kth_send() {
        let events: Events = Default::default();
        let deliverer = RecordingDeliverer {
            events: events.clone(),
            fail_on: None,
        };
        let mut pacer = RecordingPacer {
            events: events.clone(),
        };
        let campaign = campaign(vec![]);
        let mails = expand(&campaign, &recipients(5), &EmailTemplate::from_content("hi")).unwrap();

        let mut out = Vec::new();
        let processed = Batch::new(&deliverer, &mut pacer, &mut out, options(false, 2))
            .run(&campaign, &mails)
            .await
            .unwrap();

        assert_eq!(processed, 5);
        assert_eq!(
            *events.lock().unwrap(),
            [
                Event::Countdown(30),
                sent_to("r0@example.org"),
                sent_to("r1@example.org"),
                Event::Cooldown(2),
                sent_to("r2@example.org"),
                sent_to("r3@example.org"),
                Event::Cooldown(2),
                sent_to("r4@example.org"),
            ]
        );
        let transcript = String::from_utf8(out).unwrap();
        assert!(transcript.contains("WARNING: You are going to automatically send 5 mail(s)"));
        assert!(transcript.contains("> 5 of 5 mails sent"));
    }

    #[tokio::test]
    async fn no_cooldown_after_last_message() {
        let events: Events = Default::default();
        let deliverer = RecordingDeliverer {
            events: events.clone(),
            fail_on: None,
        };
        let mut pacer = RecordingPacer {
            events: events.clone(),
        };
        let campaign = campaign(vec![]);
        let mails = expand(&campaign, &recipients(4), &EmailTemplate::from_content("hi")).unwrap();

        Batch::new(&deliverer, &mut pacer, io::sink(), options(false, 2))
            .run(&campaign, &mails)
            .await
            .unwrap();

        let cooldowns = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::Cooldown(_)))
            .count();
        assert_eq!(cooldowns, 1);
    }

    #[tokio::test]
    async fn dry_run_prints_and_never_delivers() {
        let events: Events = Default::default();
        let deliverer = RecordingDeliverer {
            events: events.clone(),
            fail_on: None,
        };
        let mut pacer = RecordingPacer {
            events: events.clone(),
        };
        let campaign = campaign(vec![]);
        let mails = expand(&campaign, &recipients(3), &EmailTemplate::from_content("Hi %NAME%")).unwrap();

        let mut out = Vec::new();
        Batch::new(&deliverer, &mut pacer, &mut out, options(true, 1))
            .run(&campaign, &mails)
            .await
            .unwrap();

        assert!(events.lock().unwrap().is_empty());
        let transcript = String::from_utf8(out).unwrap();
        assert!(!transcript.contains("WARNING"));
        for i in 0..3 {
            assert!(transcript.contains(&format!("To: r{i}@example.org\r\n")));
            assert!(transcript.contains(&format!("Hi R{i}")));
            assert!(transcript.contains(&format!("> {} of 3 mails NOT sent (dry-run)", i + 1)));
        }
    }

    #[tokio::test]
    async fn first_failure_aborts_the_batch() {
        let events: Events = Default::default();
        let deliverer = RecordingDeliverer {
            events: events.clone(),
            fail_on: Some(2),
        };
        let mut pacer = RecordingPacer {
            events: events.clone(),
        };
        let campaign = campaign(vec![]);
        let mails = expand(&campaign, &recipients(4), &EmailTemplate::from_content("hi")).unwrap();

        let err = Batch::new(&deliverer, &mut pacer, io::sink(), options(false, 30))
            .run(&campaign, &mails)
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::Email(EmailError::ConfigError(_))));
        assert_eq!(
            *events.lock().unwrap(),
            [Event::Countdown(30), sent_to("r0@example.org")]
        );
    }

    #[tokio::test]
    async fn countdown_output_failure_stops_before_sending() {
        let events: Events = Default::default();
        let deliverer = RecordingDeliverer {
            events: events.clone(),
            fail_on: None,
        };
        let campaign = campaign(vec![]);
        let mails = expand(&campaign, &recipients(2), &EmailTemplate::from_content("hi")).unwrap();

        let err = Batch::new(&deliverer, &mut ClosedPacer, io::sink(), options(false, 1))
            .run(&campaign, &mails)
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::Output(e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mail_without_recipients_is_rejected_before_delivery() {
        let events: Events = Default::default();
        let deliverer = RecordingDeliverer {
            events: events.clone(),
            fail_on: None,
        };
        let mut pacer = RecordingPacer {
            events: events.clone(),
        };
        let mails = vec![Mail {
            sender: "me@example.org".into(),
            text: "orphan".into(),
            ..Default::default()
        }];

        let err = Batch::new(&deliverer, &mut pacer, io::sink(), options(false, 30))
            .run(&campaign(vec![]), &mails)
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::Email(EmailError::NoRecipients)));
        assert_eq!(*events.lock().unwrap(), [Event::Countdown(30)]);
    }

    #[tokio::test]
    async fn archive_numbers_files_contiguously() {
        let dir = TempDir::new().unwrap();
        let events: Events = Default::default();
        let deliverer = RecordingDeliverer {
            events: events.clone(),
            fail_on: None,
        };
        let mut pacer = RecordingPacer {
            events: events.clone(),
        };
        let campaign = campaign(vec![]);
        let mails = expand(&campaign, &recipients(3), &EmailTemplate::from_content("hi")).unwrap();

        let mut opts = options(true, 30);
        opts.archive = Some(EmlArchive::create(dir.path()).unwrap());
        Batch::new(&deliverer, &mut pacer, io::sink(), opts)
            .run(&campaign, &mails)
            .await
            .unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["0.eml", "1.eml", "2.eml"]);
        let first = fs::read_to_string(dir.path().join("0.eml")).unwrap();
        assert!(first.contains("To: r0@example.org\r\n"));
    }

    #[test]
    fn archive_never_overwrites() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("0.eml"), "old").unwrap();
        fs::write(dir.path().join("2.eml"), "older").unwrap();

        let mut archive = EmlArchive::create(dir.path()).unwrap();
        assert_eq!(archive.store(b"a").unwrap(), dir.path().join("1.eml"));
        assert_eq!(archive.store(b"b").unwrap(), dir.path().join("3.eml"));

        assert_eq!(fs::read_to_string(dir.path().join("0.eml")).unwrap(), "old");
        assert_eq!(fs::read_to_string(dir.path().join("2.eml")).unwrap(), "older");
        assert_eq!(fs::read_to_string(dir.path().join("3.eml")).unwrap(), "b");
    }

    #[test]
    fn archive_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("out/eml");
        let mut archive = EmlArchive::create(&nested).unwrap();
        assert_eq!(archive.store(b"x").unwrap(), nested.join("0.eml"));
    }
}
