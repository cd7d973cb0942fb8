use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use filter_candidates::construct::{CandidateSet, FilterItemId, SubjectId};
use filter_candidates::interface::{ResolutionInterface, ResolveOptions};
use filter_candidates::matcher::{ObservationQuery, match_observations};
use filter_candidates::persist::{PersistenceMode, Persistor, Store};
use filter_candidates::{CancelToken, CandidateEngine, EngineConfig, MatchedObservations, Result};

const LOCATIONS: [&str; 4] = ["E09000001", "E09000002", "E09000003", "E08000025"];
const YEARS: [i32; 3] = [2021, 2022, 2023];

struct Demo {
    subject: SubjectId,
    age_0_5: FilterItemId,
}

// Gender x Age over a few locations and years. Nobody aged 0-5 is recorded as
// male in the last location, so narrowing to it drops that option.
fn seed(store: &Store) -> Result<Demo> {
    let conn = store.session()?;
    let mut persistor = Persistor::new(&conn)?;
    persistor.bulk(|p| {
        let subject = p.add_subject("Early years population")?;
        let gender = p.add_filter(subject, "gender", "Gender", Some("Recorded gender"))?;
        let genders = p.add_filter_group(gender, "All genders")?;
        let male = p.add_filter_item(genders, "Male")?;
        let female = p.add_filter_item(genders, "Female")?;
        let age = p.add_filter(subject, "age", "Age", None)?;
        let ages = p.add_filter_group(age, "All ages")?;
        let age_0_5 = p.add_filter_item(ages, "0-5")?;
        let age_6_10 = p.add_filter_item(ages, "6-10")?;
        for (l, location) in LOCATIONS.iter().enumerate() {
            for year in YEARS {
                for n in 0..50 {
                    let age = if n % 10 == 0 { age_0_5 } else { age_6_10 };
                    let gender = if n % 2 == 0 || (age == age_0_5 && l == 3) {
                        female
                    } else {
                        male
                    };
                    p.add_observation(subject, location, year, &[gender, age])?;
                }
            }
        }
        Ok(Demo { subject, age_0_5 })
    })
}

fn print(title: &str, candidates: &CandidateSet) {
    println!("== {title}");
    match serde_json::to_string_pretty(&candidates.options()) {
        Ok(json) => println!("{json}"),
        Err(e) => println!("could not render candidates: {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args().nth(1);
    let config = EngineConfig::load(path.as_deref())?;
    let mode = match &config.database {
        Some(file) => PersistenceMode::File(file.clone()),
        None => PersistenceMode::InMemory,
    };
    info!(?mode, threshold = config.density_threshold, "starting");
    let store = Arc::new(Store::new(mode)?);
    let demo = seed(&store)?;
    let engine = Arc::new(CandidateEngine::new(&config)?);
    let interface = ResolutionInterface::new(Arc::clone(&store), engine);

    let everything = interface
        .resolve(
            demo.subject,
            MatchedObservations::Unconstrained,
            CancelToken::new(),
            ResolveOptions::default(),
        )
        .await?;
    print("no location or time period chosen", &everything);

    let narrow = ObservationQuery {
        locations: vec![LOCATIONS[3].to_string()],
        time_periods: Some((2023, 2023)),
        filter_items: vec![demo.age_0_5],
    };
    let broad = ObservationQuery {
        time_periods: Some((2021, 2023)),
        ..Default::default()
    };
    for (title, query) in [("one location, 0-5 year olds, 2023", narrow), ("all years", broad)] {
        let matched = {
            let conn = store.session()?;
            match_observations(&conn, demo.subject, &query, &CancelToken::new())?
        };
        let candidates = interface
            .resolve(demo.subject, matched, CancelToken::new(), ResolveOptions::default())
            .await?;
        print(title, &candidates);
    }
    Ok(())
}
