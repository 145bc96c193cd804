use personaflow::clients::{PgSubjectDirectory, SubjectDirectory, SubjectRecord};
use personaflow::jobs::{cutoff_days, JobFilter, JobStatus, JobStore, JobsRepo, Stage};
use personaflow::{db, telemetry};
use std::env;

const USAGE: &str = "pipelinectl <command>\n\
     Commands:\n\
     - list [stage] [status]\n\
     - show <job_id>\n\
     - purge-failed [days]\n\
     - subject <subject_id> <name> <description> <personality> [mbti] [speech_style]\n\
     \n\
     Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;

    let pool = db::make_pool(&url).await?;
    db::run_migrations(&pool).await?;
    let repo = JobsRepo::new(pool.clone());

    match args[1].as_str() {
        "list" => {
            let filter = list_filter(args.get(2), args.get(3))?;
            list(&repo, &filter).await?;
        }
        "show" => {
            let id = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: pipelinectl show <job_id>"))?;
            show(&repo, id).await?;
        }
        "purge-failed" => {
            let days: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(7);
            purge_failed(&repo, days).await?;
        }
        "subject" => {
            if args.len() < 6 {
                anyhow::bail!(
                    "usage: pipelinectl subject <subject_id> <name> <description> <personality> [mbti] [speech_style]"
                );
            }
            let subject = SubjectRecord {
                subject_id: args[2].clone(),
                name: args[3].clone(),
                description: args[4].clone(),
                personality: args[5].clone(),
                mbti: args.get(6).cloned(),
                speech_style: args.get(7).cloned(),
            };
            let dir = PgSubjectDirectory::new(pool);
            dir.upsert(&subject).await?;
            let stored = dir.get_subject(&subject.subject_id).await?;
            println!("subject saved: {stored:?}");
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn list_filter(stage: Option<&String>, status: Option<&String>) -> anyhow::Result<JobFilter> {
    let stage = match stage {
        Some(s) => Some(Stage::parse(s).ok_or_else(|| anyhow::anyhow!("unknown stage {s}"))?),
        None => None,
    };
    let statuses = match (stage, status) {
        (Some(st), Some(s)) => {
            vec![JobStatus::parse(st, s).ok_or_else(|| anyhow::anyhow!("unknown status {s}"))?]
        }
        (None, Some(_)) => anyhow::bail!("a status filter needs a stage"),
        (_, None) => Vec::new(),
    };
    Ok(JobFilter {
        stage,
        statuses,
        limit: Some(200),
        ..Default::default()
    })
}

async fn list(repo: &JobsRepo, filter: &JobFilter) -> anyhow::Result<()> {
    let jobs = repo.list(filter).await?;
    for j in &jobs {
        println!(
            "{} | {} | {} | subject={} units={}/{} ext={} chained={} uploaded={}",
            j.updated_at.to_rfc3339(),
            j.job_id,
            j.status,
            j.subject_id,
            j.produced_units,
            j.expected_units,
            j.external_ref.as_deref().unwrap_or("-"),
            j.is_chained,
            j.is_uploaded,
        );
    }
    println!("{} job(s)", jobs.len());
    Ok(())
}

async fn show(repo: &JobsRepo, job_id: &str) -> anyhow::Result<()> {
    match repo.get(job_id).await? {
        Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
        None => {
            eprintln!("job {job_id} not found");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn purge_failed(repo: &JobsRepo, days: i64) -> anyhow::Result<()> {
    let filter = JobFilter {
        statuses: vec![
            JobStatus::failed(Stage::DataGeneration),
            JobStatus::failed(Stage::FineTuning),
        ],
        updated_before: Some(cutoff_days(days)),
        ..Default::default()
    };
    let jobs = repo.list(&filter).await?;
    for j in &jobs {
        repo.delete(&j.job_id).await?;
        println!("- purged {} ({})", j.job_id, j.error_message.as_deref().unwrap_or(""));
    }
    println!("purged {} job(s) older than {days} day(s)", jobs.len());
    Ok(())
}
