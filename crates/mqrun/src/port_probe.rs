use std::time::Duration;

use mqrun_process::{ProbeBudget, ProbeOutcome};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// One TCP connect to the loopback port; the stream is dropped right away.
pub async fn probe_once(port: u16) -> bool {
    match tokio::time::timeout(
        CONNECT_TIMEOUT,
        tokio::net::TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    {
        Ok(Ok(s)) => {
            drop(s);
            true
        }
        Ok(Err(e)) => {
            tracing::debug!(port, error = %e, "port probe refused");
            false
        }
        Err(_) => {
            tracing::debug!(port, "port probe timed out");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    Open,
    Closed,
}

pub async fn wait_until_open(port: u16, budget: ProbeBudget) -> ProbeOutcome {
    wait_for(port, budget, Want::Open).await
}

pub async fn wait_until_closed(port: u16, budget: ProbeBudget) -> ProbeOutcome {
    wait_for(port, budget, Want::Closed).await
}

async fn wait_for(port: u16, budget: ProbeBudget, want: Want) -> ProbeOutcome {
    let total = budget.attempts();
    let mut attempts = 0;
    loop {
        attempts += 1;
        println!("Is application listening on port {port}? ");
        let listening = probe_once(port).await;
        let reached = match want {
            Want::Open => listening,
            Want::Closed => !listening,
        };
        let answer = if listening { "Yes" } else { "No" };

        if reached {
            println!("{answer}");
            return ProbeOutcome {
                reached: true,
                attempts,
            };
        }

        if attempts < total {
            println!(
                "{answer}. Retrying in {} seconds",
                format_delay(budget.delay)
            );
            tokio::time::sleep(budget.delay).await;
        } else {
            println!("{answer}.");
            tracing::debug!(port, attempts, ?want, "probe budget exhausted");
            return ProbeOutcome {
                reached: false,
                attempts,
            };
        }
    }
}

fn format_delay(delay: Duration) -> String {
    if delay.subsec_millis() == 0 {
        delay.as_secs().to_string()
    } else {
        format!("{:.1}", delay.as_secs_f64())
    }
}
