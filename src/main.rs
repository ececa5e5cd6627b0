//! Development binary: serves the compiled-in demo rule sets so the
//! framework can be poked at with `dig` without writing any code. Pick a
//! set with `--server-name`; the default is `demo`.

use clap::Parser;
use regex::Regex;
use yakns::cli::Cli;
use yakns::enums::RecordType;
use yakns::error::YakNsError;
use yakns::models::{Response, RuleResult};
use yakns::resourcerecord::Record;
use yakns::server::NameServer;

/// A tour of the rule flavours and response shapes.
fn demo_server() -> Result<NameServer, YakNsError> {
    let mut server = NameServer::new("demo");

    // Responses can carry answer, additional and authority records.
    server.rule("example.com", [RecordType::NS], |query| {
        let mut response = Response::new();
        for i in 1..=4 {
            let nameserver = format!("ns{i}.example.com");
            response.answers.push(Record::ns(&query.name, &nameserver)?);
            response.additional.push(Record::a(&nameserver, "1.1.1.1")?);
        }
        Ok(response.into())
    })?;

    // Wildcards match single (*) or multiple (**) labels, never a missing
    // one. Returning a record directly is enough for simple answers.
    server.rule("**.example.com", [RecordType::A], |query| {
        Ok(Record::a(&query.name, "1.2.3.4")?.into())
    })?;

    // Rules dispatch in registration order, so queries matching this one
    // never reach the catch-all below.
    server.rule("www.*.com.au", [RecordType::A], |query| {
        Ok(Record::a(&query.name, "5.6.7.8")?.into())
    })?;

    // {base_domain} substitutes the registrable domain of the query name.
    server.rule("hello.{base_domain}", [RecordType::TXT], |query| {
        let greeting = match query.name.ends_with(".com.au") {
            true => "G'day mate",
            false => "Hello friend",
        };
        Ok(Record::txt(&query.name, greeting)?.into())
    })?;

    // An empty response avoids the NXDOMAIN a missed dispatch would give.
    server.rule(
        "**.com.au",
        [RecordType::A, RecordType::AAAA, RecordType::ANY],
        |_query| Ok(RuleResult::None),
    )?;

    Ok(server)
}

/// A domain-parking server: every subdomain gets the same answers,
/// including a TXT long enough to exercise character-string splitting.
fn parking_server() -> Result<NameServer, YakNsError> {
    let mut server = NameServer::new("parking");

    server.rule("*.example.net", [RecordType::A], |query| {
        Ok(Record::a(&query.name, "1.2.3.4")?.into())
    })?;

    server.rule(
        Regex::new(r".*\.example\.net")?,
        [RecordType::TXT],
        |query| {
            let text = format!("{}{}{}", "A".repeat(255), "B".repeat(255), "C".repeat(100));
            Ok(Record::txt(&query.name, &text)?.into())
        },
    )?;

    server.rule("*.example.net", [RecordType::CAA], |query| {
        Ok(Record::caa(&query.name, 0, "issue", "test.com; foo=bar")?.into())
    })?;

    Ok(server)
}

fn build_server(name: &str) -> Result<NameServer, YakNsError> {
    match name {
        "demo" => demo_server(),
        "parking" => parking_server(),
        other => Err(YakNsError::StartupError(format!(
            "unknown server {other:?}, expected one of: demo, parking"
        ))),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let server_name = cli.server_name.clone().unwrap_or_else(|| "demo".to_string());
    let server = match build_server(&server_name) {
        Ok(server) => server,
        Err(error) => {
            eprintln!("Failed to build server: {error}");
            std::process::exit(1);
        }
    };
    let exit_code = yakns::cli::run_with(server, &cli).await;
    std::process::exit(exit_code);
}
