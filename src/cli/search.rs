use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tokio::task::spawn_blocking;

use crate::cli::{OutputFormat, SubCommandExtend};
use crate::config::{FaceDbOptions, FakeDbOptions, Opts, StoreKind};
use crate::db::{EmbeddingStore, FakeStore, UNKNOWN};
use crate::vector;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub face: FaceDbOptions,
    #[command(flatten)]
    pub fake: FakeDbOptions,
    /// 要搜索的特征库
    #[arg(long, value_enum, default_value_t = StoreKind::Face)]
    pub store: StoreKind,
    /// npy 格式的特征文件
    pub vector: PathBuf,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let query = vector::read_vector(&self.vector)?;
        let dir = opts.data_dir.clone();
        let cmd = self.clone();

        let result = spawn_blocking(move || match cmd.store {
            StoreKind::Face => {
                let store = EmbeddingStore::open(dir.faces(), &cmd.face);
                match store.compare(&query) {
                    Some(m) => json!({
                        "label": m.identity.unwrap_or_default(),
                        "face_key": m.key,
                        "similarity": m.similarity,
                    }),
                    None => json!({ "label": UNKNOWN }),
                }
            }
            StoreKind::Fake => {
                let store = FakeStore::open(dir.fake_persons(), &cmd.fake);
                let (matched, count) = store.compare(&query);
                json!({ "matched": matched, "count": count })
            }
        })
        .await?;

        match self.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            OutputFormat::Table => {
                if let Some(obj) = result.as_object() {
                    for (k, v) in obj {
                        match v.as_str() {
                            Some(s) => println!("{k}\t{s}"),
                            None => println!("{k}\t{v}"),
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
