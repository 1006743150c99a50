use anyhow::{Context, Result};
use clap::Parser;
use datumchain::{
    Blake3Hasher, DatumHasher, DatumSet, FakeWorker, Input, JobChain, JobIterator, ListJob, Worker,
};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct Cli {
    /// Pipeline description to run (JSON)
    pipeline: PathBuf,

    /// Log the individual scheduling decisions
    #[clap(long, short)]
    pub verbose: bool,
}

/// A pipeline description: the datums already committed before the first
/// job, then the jobs in submission order.
#[derive(Debug, Deserialize)]
struct Pipeline {
    #[serde(default)]
    base: Vec<Vec<Input>>,
    jobs: Vec<ListJob>,
}

impl Cli {
    pub fn run(&self) -> Result<()> {
        let file = File::open(&self.pipeline).with_context(|| {
            format!("could not open the pipeline at {}", self.pipeline.display())
        })?;
        let pipeline: Pipeline = serde_json::from_reader(BufReader::new(file))
            .context("could not parse the pipeline description")?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("could not start the async runtime")?;

        runtime.block_on(run_pipeline(pipeline))
    }
}

/// Drive every job in the pipeline through the chain at once, one task per
/// job. Jobs that share datums with an earlier job sort themselves out: their
/// iterators block until the earlier job reports an outcome.
async fn run_pipeline(pipeline: Pipeline) -> Result<()> {
    let chain = JobChain::new(Box::new(Blake3Hasher));
    let base: DatumSet = pipeline
        .base
        .iter()
        .map(|inputs| Blake3Hasher.hash(inputs))
        .collect();
    chain.initialize(base)?;

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    for job in pipeline.jobs {
        let mut iterator = chain
            .start(&job)
            .with_context(|| format!("could not start job {}", job.name))?;
        let chain = chain.clone();
        let cancel = cancel.clone();

        tasks.push(tokio::spawn(async move {
            let outcome = drain(&mut iterator, &FakeWorker::default(), &cancel).await;

            match outcome {
                Ok(processed) => {
                    chain.succeed(&job, DatumSet::new())?;
                    log::info!("job {} processed {} datums", job.name, processed);
                    Ok(())
                }
                Err(problem) => {
                    chain.fail(&job)?;
                    Err(problem.context(format!("job {} did not finish", job.name)))
                }
            }
        }));
    }

    for task in tasks {
        task.await.context("a job task panicked")??;
    }

    log::info!("pipeline complete");
    Ok(())
}

async fn drain(
    iterator: &mut JobIterator,
    worker: &impl Worker,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut processed = 0;

    while iterator.next(cancel).await? {
        worker.process(iterator.datum())?;
        processed += 1;
    }

    Ok(processed)
}

#[cfg(test)]
mod test_cli {
    use super::Pipeline;

    #[test]
    fn parses_a_pipeline_description() {
        let pipeline: Pipeline = serde_json::from_str(
            r#"{
                "base": [[{"name": "seed.txt", "hash": "00ff"}]],
                "jobs": [
                    {
                        "name": "extract",
                        "datums": [
                            [{"name": "logs-1.txt", "hash": "c0ffee01"}],
                            [{"name": "logs-2.txt", "hash": "c0ffee02"}]
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(pipeline.base.len(), 1);
        assert_eq!(pipeline.jobs.len(), 1);
        assert_eq!(pipeline.jobs[0].name, "extract");
        assert_eq!(pipeline.jobs[0].datums.len(), 2);
    }

    #[test]
    fn the_base_may_be_left_out() {
        let pipeline: Pipeline = serde_json::from_str(r#"{"jobs": []}"#).unwrap();

        assert!(pipeline.base.is_empty());
        assert!(pipeline.jobs.is_empty());
    }
}
