//! Job-processing loop driven by the push channel.
//!
//! Each cycle processes jobs, makes sure the push channel is up, then waits
//! for a notification or the poll period, whichever comes first. Any failure
//! is logged and followed by a fixed retry sleep; the loop itself never exits
//! until shutdown.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn};

use crate::auth::CredentialSource;
use crate::xmpp::{Dialer, Endpoint, TlsDialer, XmppConnection, XmppSettings};

/// Fetches and prints pending jobs. Called once per cycle.
pub trait JobSource: Send {
    fn process_jobs(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Runs an operator-supplied command for each cycle.
///
/// With no command configured, cycles only keep the push channel alive.
#[derive(Debug, Clone, Default)]
pub struct CommandJobSource {
    command: Option<Vec<String>>,
}

impl CommandJobSource {
    pub fn new(command: Option<Vec<String>>) -> Self {
        Self { command }
    }
}

impl JobSource for CommandJobSource {
    async fn process_jobs(&mut self) -> anyhow::Result<()> {
        let Some((program, args)) = self.command.as_deref().and_then(<[String]>::split_first) else {
            debug!("No job command configured, skipping job processing");
            return Ok(());
        };

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run job command '{program}'"))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(program = %program, "{line}");
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!(program = %program, "{line}");
        }

        if !output.status.success() {
            bail!("job command '{program}' exited with {}", output.status);
        }
        Ok(())
    }
}

/// Loop timing and target.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub endpoint: Endpoint,
    /// Job poll period; also the notification wait timeout.
    pub poll: Duration,
    /// Sleep after a failed cycle.
    pub retry: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            poll: Duration::from_secs(3600),
            retry: Duration::from_secs(60),
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The push channel delivered a stanza.
    Notified,
    /// The poll period ran out first.
    PollElapsed,
}

enum Step {
    Shutdown,
    Cycle(anyhow::Result<CycleOutcome>),
}

pub struct Daemon<J: JobSource, D: Dialer + Clone = TlsDialer> {
    jobs: J,
    credentials: Box<dyn CredentialSource>,
    dialer: D,
    xmpp: XmppSettings,
    settings: DaemonSettings,
    connection: Option<XmppConnection<D>>,
    connections_opened: u64,
}

impl<J: JobSource, D: Dialer + Clone> Daemon<J, D> {
    pub fn new(
        jobs: J,
        credentials: Box<dyn CredentialSource>,
        dialer: D,
        xmpp: XmppSettings,
        settings: DaemonSettings,
    ) -> Self {
        Self {
            jobs,
            credentials,
            dialer,
            xmpp,
            settings,
            connection: None,
            connections_opened: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(XmppConnection::is_connected)
    }

    /// One cycle: process jobs, (re)connect if needed, wait.
    pub async fn run_once(&mut self) -> anyhow::Result<CycleOutcome> {
        self.jobs.process_jobs().await.context("job processing failed")?;

        if !self.is_connected() {
            self.connection = None;
            self.connections_opened += 1;
            let span = info_span!("xmpp", conn = self.connections_opened);
            let mut connection = XmppConnection::new(self.dialer.clone(), self.xmpp.clone(), span);

            let credentials = self.credentials.credentials().context("could not load credentials")?;
            connection
                .connect_endpoint(&self.settings.endpoint, &credentials)
                .await
                .with_context(|| format!("could not connect to {}", self.settings.endpoint))?;
            self.connection = Some(connection);
        }

        let Some(connection) = self.connection.as_mut() else {
            bail!("push channel missing after connect");
        };
        let notified = connection
            .await_notification(Some(self.settings.poll))
            .await
            .context("push channel failed")?;

        if notified {
            debug!("Woken by push channel");
            Ok(CycleOutcome::Notified)
        } else {
            debug!(poll_secs = self.settings.poll.as_secs(), "Poll period elapsed");
            Ok(CycleOutcome::PollElapsed)
        }
    }

    /// Run cycles until `shutdown` fires, sleeping `retry` after each failure.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            endpoint = %self.settings.endpoint,
            poll_secs = self.settings.poll.as_secs(),
            retry_secs = self.settings.retry.as_secs(),
            "Job loop started"
        );

        loop {
            let step = tokio::select! {
                _ = shutdown.recv() => Step::Shutdown,
                result = self.run_once() => Step::Cycle(result),
            };

            match step {
                Step::Shutdown => break,
                Step::Cycle(Ok(_)) => {}
                Step::Cycle(Err(e)) => {
                    warn!(
                        error = %format!("{e:#}"),
                        retry_secs = self.settings.retry.as_secs(),
                        "Cycle failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.settings.retry) => {}
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Close the push channel, if open.
    pub async fn shutdown(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        info!("Job loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::xmpp::testing::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncWriteExt};

    #[derive(Clone, Default)]
    struct FakeJobs {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl JobSource for FakeJobs {
        async fn process_jobs(&mut self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("spooler unavailable");
            }
            Ok(())
        }
    }

    fn daemon(jobs: FakeJobs, dialer: Arc<ScriptedDialer>) -> Daemon<FakeJobs, Arc<ScriptedDialer>> {
        Daemon::new(
            jobs,
            Box::new(Credentials::new("foo@example.com", "ya29.token")),
            dialer,
            XmppSettings::default(),
            DaemonSettings {
                poll: Duration::from_secs(30),
                retry: Duration::from_secs(60),
                ..DaemonSettings::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_connects_and_reuses_connection() {
        let (client, server) = duplex(64 * 1024);
        let server = tokio::spawn(serve(server, happy_script(PUSH)));
        let jobs = FakeJobs::default();
        let mut daemon = daemon(jobs.clone(), Arc::new(ScriptedDialer::new(vec![client])));

        assert_eq!(daemon.run_once().await.unwrap(), CycleOutcome::Notified);
        let (_server, _) = server.await.unwrap();
        assert!(daemon.is_connected());

        // No second stream is scripted, so this only passes if the channel is reused.
        assert_eq!(daemon.run_once().await.unwrap(), CycleOutcome::PollElapsed);
        assert_eq!(jobs.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let jobs = FakeJobs::default();
        let mut daemon = daemon(jobs.clone(), Arc::new(ScriptedDialer::new(Vec::new())));

        let err = daemon.run_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("could not connect"));
        assert!(!daemon.is_connected());
        assert_eq!(jobs.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_failure_keeps_healthy_connection() {
        let (client, server) = duplex(64 * 1024);
        let server = tokio::spawn(serve(server, happy_script("")));
        let jobs = FakeJobs::default();
        let mut daemon = daemon(jobs.clone(), Arc::new(ScriptedDialer::new(vec![client])));

        assert_eq!(daemon.run_once().await.unwrap(), CycleOutcome::PollElapsed);
        let (_server, _) = server.await.unwrap();

        daemon.jobs.fail = true;
        let err = daemon.run_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("spooler unavailable"));
        assert!(daemon.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_channel_is_rebuilt_next_cycle() {
        let (first_client, first_server) = duplex(64 * 1024);
        let (second_client, second_server) = duplex(64 * 1024);
        let jobs = FakeJobs::default();
        let mut daemon = daemon(
            jobs.clone(),
            Arc::new(ScriptedDialer::new(vec![first_client, second_client])),
        );

        let first = tokio::spawn(async move {
            let (mut server, _) = serve(first_server, happy_script("")).await;
            server.write_all(b"</stream:stream>").await.unwrap();
            server
        });
        let err = daemon.run_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("stream closed by server"));
        assert!(!daemon.is_connected());
        let _first = first.await.unwrap();

        let second = tokio::spawn(serve(second_server, happy_script(PUSH)));
        assert_eq!(daemon.run_once().await.unwrap(), CycleOutcome::Notified);
        assert!(daemon.is_connected());
        let (_server, _) = second.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_shutdown() {
        let jobs = FakeJobs::default();
        let mut daemon = daemon(jobs.clone(), Arc::new(ScriptedDialer::new(Vec::new())));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let stopper = async move {
            tokio::time::sleep(Duration::from_secs(150)).await;
            shutdown_tx.send(()).unwrap();
        };
        tokio::join!(daemon.run(shutdown_rx), stopper);

        // Cycles at t=0, 60 and 120; shutdown lands during the third retry sleep.
        assert_eq!(jobs.calls.load(Ordering::SeqCst), 3);
        assert!(!daemon.is_connected());
    }

    #[tokio::test]
    async fn test_command_job_source_reports_exit_status() {
        let mut ok = CommandJobSource::new(Some(vec!["sh".into(), "-c".into(), "echo fetched".into()]));
        assert!(ok.process_jobs().await.is_ok());

        let mut failing = CommandJobSource::new(Some(vec!["sh".into(), "-c".into(), "exit 3".into()]));
        let err = failing.process_jobs().await.unwrap_err();
        assert!(err.to_string().contains("exited with"));

        let mut missing = CommandJobSource::new(Some(vec!["/nonexistent/cloudprint-jobs".into()]));
        assert!(missing.process_jobs().await.is_err());

        let mut none = CommandJobSource::new(None);
        assert!(none.process_jobs().await.is_ok());
    }
}
