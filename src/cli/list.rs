use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::task::spawn_blocking;

use crate::cli::SubCommandExtend;
use crate::config::{FaceDbOptions, FakeDbOptions, Opts, StoreKind};
use crate::db::{EmbeddingStore, FakeStore};

#[derive(Parser, Debug, Clone)]
pub struct ListCommand {
    /// 要列出的特征库
    #[arg(long, value_enum, default_value_t = StoreKind::Face)]
    pub store: StoreKind,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for ListCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let dir = opts.data_dir.clone();
        match self.store {
            StoreKind::Face => {
                let store = spawn_blocking(move || {
                    EmbeddingStore::open(dir.faces(), &FaceDbOptions::default())
                })
                .await?;
                let users = store.identities();
                match self.output_format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&users)?),
                    OutputFormat::Table => {
                        for (identity, keys) in users {
                            println!("{identity}\t{}", keys.join(","));
                        }
                    }
                }
            }
            StoreKind::Fake => {
                let store = spawn_blocking(move || {
                    FakeStore::open(dir.fake_persons(), &FakeDbOptions::default())
                })
                .await?;
                let keys = store.keys();
                match self.output_format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
                    OutputFormat::Table => keys.iter().for_each(|key| println!("{key}")),
                }
            }
        }
        Ok(())
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}
