use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use log::warn;

use crate::backend::{KvBackend, MemoryBackend, RestBackend, RestConfig};
use crate::comic::{ComicCache, ComicRef, ComicResolver, HttpFetcher, PageFetcher, ResolverConfig};
use crate::comments::{self, CommentThreadStore};
use crate::config::{self, Config};
use crate::dates;
use crate::error::Error;
use crate::favorites::{self, FavoritesStore};
use crate::identity::{self, CurrentUser, IdentityOptions, UserIdentity};
use crate::rpc::{PageProxy, Procedures, Router, RpcServer};
use crate::storage;

const RECENT_COMMENTS: usize = 10;

pub const USAGE: &str = "\
Commands:
  show [DATE]                        Show the strip for DATE (default today)
  random                             Show a strip from a random day
  check                              Check whether today's strip is out
  favorites                          List your favorites
  favorite DATE                      Favorite the strip for DATE
  unfavorite DATE                    Remove a favorite
  count DATE                         How many people favorited DATE
  comments DATE                      Show the latest comments for DATE
  comment DATE TEXT [--reply-to ID]  Post a comment
  delete-comment DATE ID             Delete one of your comments
  whoami                             Show your identity and recovery code
  rename NAME                        Change your display name
  email [ADDRESS]                    Set or clear your email
  rebind USER_ID                     Move this device to another user id
  restore CODE                       Restore an identity from a recovery code
  serve                              Run the procedure server and page proxy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Show(Option<String>),
    Random,
    Check,
    Favorites,
    Favorite(String),
    Unfavorite(String),
    Count(String),
    Comments(String),
    Comment {
        date: String,
        text: String,
        reply_to: Option<String>,
    },
    DeleteComment {
        date: String,
        id: String,
    },
    WhoAmI,
    Rename(String),
    Email(Option<String>),
    Rebind(String),
    Restore(String),
    Serve,
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            return Ok(Command::Show(None));
        };
        let one = |what: &str| -> Result<String> {
            rest.first()
                .cloned()
                .ok_or_else(|| anyhow!("{name}: {what} required\n\n{USAGE}"))
        };
        let command = match name.as_str() {
            "show" => Command::Show(rest.first().cloned()),
            "random" => Command::Random,
            "check" => Command::Check,
            "favorites" => Command::Favorites,
            "favorite" => Command::Favorite(one("DATE")?),
            "unfavorite" => Command::Unfavorite(one("DATE")?),
            "count" => Command::Count(one("DATE")?),
            "comments" => Command::Comments(one("DATE")?),
            "comment" => {
                let mut reply_to = None;
                let mut positional = Vec::new();
                let mut iter = rest.iter();
                while let Some(arg) = iter.next() {
                    if arg == "--reply-to" {
                        reply_to = Some(
                            iter.next()
                                .cloned()
                                .ok_or_else(|| anyhow!("comment: --reply-to needs an id"))?,
                        );
                    } else {
                        positional.push(arg.clone());
                    }
                }
                if positional.len() < 2 {
                    bail!("comment: DATE and TEXT required\n\n{USAGE}");
                }
                let date = positional.remove(0);
                Command::Comment {
                    date,
                    text: positional.join(" "),
                    reply_to,
                }
            }
            "delete-comment" => match rest {
                [date, id, ..] => Command::DeleteComment {
                    date: date.clone(),
                    id: id.clone(),
                },
                _ => bail!("delete-comment: DATE and ID required\n\n{USAGE}"),
            },
            "whoami" => Command::WhoAmI,
            "rename" => {
                if rest.is_empty() {
                    bail!("rename: NAME required\n\n{USAGE}");
                }
                Command::Rename(rest.join(" "))
            }
            "email" => Command::Email(rest.first().cloned()),
            "rebind" => Command::Rebind(one("USER_ID")?),
            "restore" => Command::Restore(one("CODE")?),
            "serve" => Command::Serve,
            other => bail!("unknown command {other:?}\n\n{USAGE}"),
        };
        Ok(command)
    }
}

pub struct App {
    config: Config,
    backend: Arc<dyn KvBackend>,
    fetcher: Arc<dyn PageFetcher>,
    resolver: ComicResolver,
    favorites: Arc<FavoritesStore>,
    comments: Arc<CommentThreadStore>,
    identity: UserIdentity,
}

impl App {
    pub fn build(config: Config) -> Result<Self> {
        let store = storage::Store::open(storage::Options {
            path: config.storage.path.clone(),
        })
        .context("open storage")?;

        let backend: Arc<dyn KvBackend> = if config.backend.url.trim().is_empty() {
            warn!("backend.url is not set; favorites and comments stay in memory for this run");
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(
                RestBackend::new(RestConfig {
                    base_url: config.backend.url.clone(),
                    auth: config.backend.auth.clone(),
                    timeout: Some(config.backend.timeout),
                    http_client: None,
                })
                .context("connect backend")?,
            )
        };
        let fetcher = Arc::new(
            HttpFetcher::new(&config.comic.user_agent, config.comic.timeout)
                .context("build page fetcher")?,
        );
        Self::with_parts(config, store, backend, fetcher)
    }

    pub fn with_parts(
        config: Config,
        store: storage::Store,
        backend: Arc<dyn KvBackend>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Result<Self> {
        let profile = identity::load_or_create(&store).context("load identity")?;
        let user = CurrentUser::new(profile);

        let resolver = ComicResolver::new(
            ResolverConfig::from(&config.comic),
            fetcher.clone(),
            Arc::new(ComicCache::new()),
        )?;
        let favorites = Arc::new(FavoritesStore::new(
            backend.clone(),
            user.clone(),
            config.cache.favorite_count_ttl,
        ));
        let comments = Arc::new(CommentThreadStore::new(
            backend.clone(),
            user.clone(),
            config.cache.comment_ttl,
        ));
        let identity = UserIdentity::new(
            store,
            backend.clone(),
            favorites.clone(),
            user,
            IdentityOptions {
                strict_recovery: config.identity.strict_recovery,
            },
        );

        Ok(Self {
            config,
            backend,
            fetcher,
            resolver,
            favorites,
            comments,
            identity,
        })
    }

    pub fn execute<W: Write>(&self, command: Command, out: &mut W) -> Result<()> {
        match command {
            Command::Show(date) => {
                let comic = match date {
                    Some(text) => self.resolver.resolve_str(&text)?,
                    None => self.resolver.resolve(dates::today())?,
                };
                self.print_comic(&comic, out)?;
            }
            Command::Random => {
                let date = self.resolver.range().random(&mut rand::thread_rng());
                let comic = self.resolver.resolve(date)?;
                self.print_comic(&comic, out)?;
            }
            Command::Check => {
                let today = dates::today();
                match self.resolver.resolve(today) {
                    Ok(comic) => writeln!(
                        out,
                        "New strip for {}: {}",
                        dates::format_storage(comic.date),
                        comic.image_url
                    )?,
                    Err(Error::Resolution(reason)) => writeln!(
                        out,
                        "No strip for {} yet: {reason}",
                        dates::format_storage(today)
                    )?,
                    Err(err) => return Err(err.into()),
                }
            }
            Command::Favorites => {
                let listed = favorites::display_order(&self.favorites.list());
                if listed.is_empty() {
                    writeln!(out, "No favorites yet.")?;
                }
                for favorite in listed {
                    writeln!(out, "{}  {}", favorite.date_key, favorite.image_url)?;
                }
            }
            Command::Favorite(text) => {
                let comic = self.resolver.resolve(parse_date(&text)?)?;
                let favorite = self
                    .favorites
                    .add(&dates::format_storage(comic.date), &comic.image_url)?;
                writeln!(out, "Favorited {}", favorite.date_key)?;
            }
            Command::Unfavorite(text) => {
                let key = dates::format_storage(parse_date(&text)?);
                if self.favorites.remove(&key) {
                    writeln!(out, "Removed {key} from favorites")?;
                } else {
                    writeln!(out, "{key} was not a favorite")?;
                }
            }
            Command::Count(text) => {
                let key = dates::format_storage(parse_date(&text)?);
                let count = self.favorites.count_for_date(&key, true);
                writeln!(out, "{key}: favorited by {count}")?;
            }
            Command::Comments(text) => {
                let key = dates::format_storage(parse_date(&text)?);
                self.print_comments(&key, out)?;
            }
            Command::Comment {
                date,
                text,
                reply_to,
            } => {
                let comment = self.comments.add(&date, &text, reply_to.as_deref())?;
                writeln!(out, "Posted comment {} on {}", comment.id, comment.date_key)?;
            }
            Command::DeleteComment { date, id } => {
                let thread = self.comments.fetch(&date)?;
                let Some(comment) = thread.iter().find(|c| c.id == id) else {
                    bail!("no comment {id} on {date}");
                };
                if !self.comments.can_delete(comment) {
                    bail!("only {} can delete comment {id}", comment.author_name);
                }
                self.comments.remove(&date, &id)?;
                writeln!(out, "Deleted comment {id}")?;
            }
            Command::WhoAmI => {
                let profile = self.identity.current();
                writeln!(out, "User id:       {}", profile.user_id)?;
                writeln!(out, "Display name:  {}", profile.display_name)?;
                writeln!(out, "Recovery code: {}", profile.recovery_code)?;
                if let Some(email) = profile.email {
                    writeln!(out, "Email:         {email}")?;
                }
            }
            Command::Rename(name) => {
                let profile = self.identity.set_display_name(&name)?;
                writeln!(out, "Display name set to {}", profile.display_name)?;
            }
            Command::Email(address) => {
                let profile = self.identity.set_email(address.as_deref())?;
                match profile.email {
                    Some(email) => writeln!(out, "Email set to {email}")?,
                    None => writeln!(out, "Email cleared")?,
                }
            }
            Command::Rebind(user_id) => {
                let profile = self.identity.rebind(&user_id)?;
                writeln!(out, "Now using {}", profile.user_id)?;
                writeln!(out, "Recovery code: {}", profile.recovery_code)?;
            }
            Command::Restore(code) => {
                let outcome = self.identity.restore_from_recovery_code(&code)?;
                if outcome.matched {
                    writeln!(
                        out,
                        "Restored {} ({})",
                        outcome.profile.user_id, outcome.profile.display_name
                    )?;
                } else {
                    writeln!(
                        out,
                        "No account had that code; started {} ({}) bound to it",
                        outcome.profile.user_id, outcome.profile.display_name
                    )?;
                }
            }
            Command::Serve => {
                let server = RpcServer::start(&self.config.rpc.listen, self.router()?)?;
                writeln!(out, "Serving on http://{}", server.addr())?;
                out.flush()?;
                server.wait();
            }
        }
        Ok(())
    }

    fn router(&self) -> Result<Router> {
        let proxy = PageProxy::new(&self.config.comic.site, self.fetcher.clone())?;
        Ok(Router::new(
            Procedures::new(self.backend.clone(), self.comments.clone()),
            proxy,
        ))
    }

    fn print_comic<W: Write>(&self, comic: &ComicRef, out: &mut W) -> Result<()> {
        let key = dates::format_storage(comic.date);
        writeln!(out, "Date:      {key}")?;
        writeln!(out, "Image:     {}", comic.image_url)?;
        writeln!(out, "Source:    {}", self.resolver.source_url(comic.date))?;
        let mine = if self.favorites.is_favorite(&key) {
            " (including you)"
        } else {
            ""
        };
        writeln!(
            out,
            "Favorites: {}{mine}",
            self.favorites.count_for_date(&key, false)
        )?;
        writeln!(out, "Comments:  {}", self.comments.list(&key).len())?;
        Ok(())
    }

    fn print_comments<W: Write>(&self, key: &str, out: &mut W) -> Result<()> {
        let listed = self.comments.list(key);
        if listed.is_empty() {
            writeln!(out, "No comments on {key} yet.")?;
            return Ok(());
        }
        for thread in comments::build_threads(comments::recent(&listed, RECENT_COMMENTS)) {
            let root = &thread.root;
            writeln!(
                out,
                "[{}] {} ({}): {}",
                root.id,
                root.author_name,
                root.created_at.format("%Y-%m-%d %H:%M"),
                root.text
            )?;
            for reply in &thread.replies {
                writeln!(
                    out,
                    "    [{}] {} ({}): {}",
                    reply.id,
                    reply.author_name,
                    reply.created_at.format("%Y-%m-%d %H:%M"),
                    reply.text
                )?;
            }
        }
        Ok(())
    }
}

fn parse_date(text: &str) -> Result<NaiveDate> {
    dates::parse(text)
        .ok_or_else(|| Error::validation(format!("unrecognised date {text:?}")).into())
}

pub fn run(args: Vec<String>) -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let command = Command::parse(&args)?;
    let app = App::build(cfg)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    app.execute(command, &mut out)
}
