use clap::{Parser, Subcommand, ValueEnum};
use eyre::{Context, OptionExt};
use oauth2::{ClientSecret, RefreshToken};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use vidflow::model::PrivacyStatus;
use vidflow::store::{AccountDirectory, StateLock};
use vidflow::{
    Account, AccountId, Actor, ApprovalWorkflow, Capability, Config, FsVideoSource, GoogleOAuth,
    MemoryStore, NewVideo, PublishOrchestrator, PublishOutcome, Remedy, TokenBroker, VideoId,
    YouTubeUploader,
};

#[derive(Debug, Parser)]
#[command(name = "vidflow-cli", version, about = "Review submitted videos and publish them to YouTube")]
struct Cli {
    /// JSON file holding videos, accounts, and credentials between runs.
    #[arg(long, env = "VIDFLOW_STATE", default_value = "vidflow-state.json")]
    state: PathBuf,

    /// JSON config file; flags and environment variables override its values.
    #[arg(long, env = "VIDFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "VIDFLOW_CLIENT_ID")]
    client_id: Option<String>,

    #[arg(long, env = "VIDFLOW_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Directory that `submit --file` paths are relative to.
    #[arg(long, env = "VIDFLOW_MEDIA_ROOT")]
    media_root: Option<PathBuf>,

    /// Visibility of newly published videos.
    #[arg(long, env = "VIDFLOW_PRIVACY", value_enum)]
    privacy: Option<Privacy>,

    /// Give up on a publish after this many seconds.
    #[arg(long, env = "VIDFLOW_PUBLISH_TIMEOUT")]
    publish_timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Authorize publishing to an account's channel in the browser.
    Connect { account: String },
    /// Store a refresh token obtained elsewhere.
    Grant {
        account: String,
        #[arg(long, env = "VIDFLOW_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: String,
    },
    /// Register or update an account.
    Account {
        id: String,
        #[arg(long, value_enum)]
        capability: Role,
        /// For editors, the creator they work for.
        #[arg(long)]
        creator: Option<String>,
    },
    /// Submit a draft for review.
    Submit {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Path of the video file, relative to the media root.
        #[arg(long)]
        file: String,
        #[arg(long)]
        creator: String,
        #[arg(long)]
        editor: String,
    },
    /// List the pending videos an account may review.
    Pending {
        #[arg(long = "as")]
        actor: String,
    },
    /// Approve a video and publish it.
    Approve {
        video: String,
        #[arg(long = "as")]
        actor: String,
    },
    /// Reject a pending video.
    Reject {
        video: String,
        #[arg(long = "as")]
        actor: String,
    },
    /// Publish an approved video whose earlier publish failed.
    Retry {
        video: String,
        #[arg(long = "as")]
        actor: String,
    },
    /// Print a video's record.
    Show { video: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Role {
    Creator,
    Editor,
    Admin,
}

impl From<Role> for Capability {
    fn from(role: Role) -> Self {
        match role {
            Role::Creator => Capability::Creator,
            Role::Editor => Capability::Editor,
            Role::Admin => Capability::Admin,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Privacy {
    Private,
    Unlisted,
    Public,
}

impl From<Privacy> for PrivacyStatus {
    fn from(privacy: Privacy) -> Self {
        match privacy {
            Privacy::Private => PrivacyStatus::Private,
            Privacy::Unlisted => PrivacyStatus::Unlisted,
            Privacy::Public => PrivacyStatus::Public,
        }
    }
}

impl Cli {
    async fn load_config(&self) -> eyre::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path).await?,
            None => Config::default(),
        };
        if let Some(client_id) = &self.client_id {
            config.oauth_client_id = client_id.clone();
        }
        if let Some(secret) = &self.client_secret {
            config.oauth_client_secret = Some(ClientSecret::new(secret.clone()));
        }
        if let Some(root) = &self.media_root {
            config.media_root = root.clone();
        }
        if let Some(privacy) = self.privacy {
            config.privacy = privacy.into();
        }
        if let Some(secs) = self.publish_timeout {
            config.publish_timeout_secs = secs;
        }
        Ok(config)
    }
}

impl Command {
    /// Whether the command may talk to Google.
    fn needs_authority(&self) -> bool {
        matches!(
            self,
            Command::Connect { .. } | Command::Approve { .. } | Command::Retry { .. }
        )
    }
}

struct App {
    store: Arc<MemoryStore>,
    oauth: GoogleOAuth,
    broker: TokenBroker,
    workflow: ApprovalWorkflow,
}

impl App {
    fn new(config: &Config, store: Arc<MemoryStore>) -> eyre::Result<Self> {
        let oauth = GoogleOAuth::new(config)?;
        let broker = TokenBroker::new(store.clone(), Arc::new(oauth.clone()));
        let uploader = YouTubeUploader::new(config)?;
        let publisher = PublishOrchestrator::new(
            config,
            broker.clone(),
            Arc::new(uploader),
            Arc::new(FsVideoSource::new(&config.media_root)),
        );
        let workflow =
            ApprovalWorkflow::new(config, store.clone(), store.clone(), broker.clone(), publisher);
        Ok(Self {
            store,
            oauth,
            broker,
            workflow,
        })
    }

    async fn actor(&self, id: &str) -> eyre::Result<Actor> {
        let id = AccountId::from(id);
        let account = self
            .store
            .account(&id)
            .await?
            .ok_or_eyre("unknown account; register it with `vidflow-cli account` first")?;
        Ok(Actor::new(id, account.capability))
    }

    async fn run(&self, command: Command) -> eyre::Result<()> {
        match command {
            Command::Connect { account } => {
                let grant = self
                    .oauth
                    .authorize()
                    .await
                    .context("authorize channel access")?;
                let refresh = grant
                    .refresh
                    .ok_or_eyre("authority did not issue a refresh credential")?;
                self.broker
                    .store_grant(&account.as_str().into(), refresh, Some(grant.access))
                    .await?;
                println!("{account} can now publish");
            }
            Command::Grant {
                account,
                refresh_token,
            } => {
                self.broker
                    .store_grant(
                        &account.as_str().into(),
                        RefreshToken::new(refresh_token),
                        None,
                    )
                    .await?;
                println!("stored grant for {account}");
            }
            Command::Account {
                id,
                capability,
                creator,
            } => {
                self.store
                    .upsert_account(Account {
                        id: id.as_str().into(),
                        capability: capability.into(),
                        linked_creator: creator.map(AccountId::from),
                    })
                    .await;
                println!("saved account {id}");
            }
            Command::Submit {
                title,
                description,
                file,
                creator,
                editor,
            } => {
                let video = self
                    .workflow
                    .submit(NewVideo {
                        title,
                        description,
                        locator: file.into(),
                        creator: creator.into(),
                        editor: editor.into(),
                    })
                    .await?;
                println!("{}", video.id);
            }
            Command::Pending { actor } => {
                let actor = self.actor(&actor).await?;
                for video in self.workflow.list_pending(&actor).await? {
                    println!(
                        "{}  {}  (creator {}, submitted by {})",
                        video.id, video.title, video.creator, video.editor
                    );
                }
            }
            Command::Approve { video, actor } => {
                let actor = self.actor(&actor).await?;
                let id = VideoId::from(video);
                let outcome = self.workflow.approve(&id, &actor).await;
                self.report(&id, &actor, outcome)?;
            }
            Command::Retry { video, actor } => {
                let actor = self.actor(&actor).await?;
                let id = VideoId::from(video);
                let outcome = self.workflow.retry_publish(&id, &actor).await;
                self.report(&id, &actor, outcome)?;
            }
            Command::Reject { video, actor } => {
                let actor = self.actor(&actor).await?;
                let video = self.workflow.reject(&video.into(), &actor).await?;
                println!("rejected {}", video.id);
            }
            Command::Show { video } => {
                let video = self.workflow.get(&video.into()).await?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&video).context("serialize video")?
                );
            }
        }
        Ok(())
    }

    fn report(
        &self,
        id: &VideoId,
        actor: &Actor,
        outcome: vidflow::Result<PublishOutcome>,
    ) -> eyre::Result<()> {
        match outcome {
            Ok(PublishOutcome::Published { external_id }) => {
                println!("published {id}: https://youtu.be/{external_id}");
                Ok(())
            }
            Ok(PublishOutcome::ApprovedNotPublished { error }) => {
                println!("approved {id}, but it was not published: {error}");
                print_remedy(error.remedy(), id, actor);
                Ok(())
            }
            Err(error) => {
                print_remedy(error.remedy(), id, actor);
                Err(error.into())
            }
        }
    }
}

fn print_remedy(remedy: Remedy, id: &VideoId, actor: &Actor) {
    match remedy {
        Remedy::Reconnect => {
            eprintln!(
                "hint: reconnect the channel with `vidflow-cli connect {}`",
                actor.id
            )
        }
        Remedy::Retry => eprintln!(
            "hint: try again later with `vidflow-cli retry {id} --as {}`",
            actor.id
        ),
        Remedy::FixMetadata => eprintln!("hint: fix the video's title or description"),
        Remedy::None => {}
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.load_config().await?;
    if cli.command.needs_authority() {
        config.validate()?;
    }

    // held until the state is saved, so concurrent runs cannot approve from the same snapshot
    let _lock = StateLock::acquire(&cli.state).await?;
    let store = Arc::new(MemoryStore::load(&cli.state).await?);
    let app = App::new(&config, Arc::clone(&store))?;

    let result = app.run(cli.command).await;
    // approvals are recorded even when the publish that followed failed
    store.save(&cli.state).await.context("save state")?;
    result
}
