//! Simulierter Intercom-Endpunkt
//!
//! Erzeugt einen Sinuston als Mikrofon und verwirft Lautsprecher-Audio
//! (Pegel im Trace-Log). Bedienung ueber stdin: `a` nimmt an, `s` stoppt.

use anyhow::Result;
use intercom_endpoint::{EndpointConfig, EndpointIo, EndpointRuntime};
use intercom_protocol::pcm::SAMPLE_RATE;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

/// Frequenz des Testtons
const TON_HZ: f32 = 440.0;

#[tokio::main]
async fn main() -> Result<()> {
    let config_pfad = std::env::var("INTERCOM_ENDPOINT_CONFIG")
        .unwrap_or_else(|_| "endpoint.toml".into());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("INTERCOM_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = EndpointConfig::laden(&config_pfad)?;
    let samples_pro_block = config.chunk_bytes / 2;
    let mic_bits = config.mic_bits;

    let (mic_tx, mic_rx) = mpsc::channel::<Vec<i32>>(16);
    let (lautsprecher_tx, mut lautsprecher_rx) = mpsc::channel::<Vec<i16>>(config.lautsprecher_queue);

    let runtime = EndpointRuntime::binden(config).await?;
    let handle = runtime.starten(EndpointIo {
        mikrofon: mic_rx,
        lautsprecher: lautsprecher_tx,
    })?;

    // Mikrofon: Sinus im Takt eines Blocks
    tokio::spawn(async move {
        let block_dauer =
            Duration::from_micros(samples_pro_block as u64 * 1_000_000 / SAMPLE_RATE as u64);
        let mut takt = interval(block_dauer);
        let mut phase = 0f32;
        let schritt = 2.0 * std::f32::consts::PI * TON_HZ / SAMPLE_RATE as f32;
        loop {
            takt.tick().await;
            let block: Vec<i32> = (0..samples_pro_block)
                .map(|_| {
                    phase = (phase + schritt) % (2.0 * std::f32::consts::PI);
                    let s = (phase.sin() * 8000.0) as i32;
                    if mic_bits == 32 {
                        s << 16
                    } else {
                        s
                    }
                })
                .collect();
            if mic_tx.send(block).await.is_err() {
                break;
            }
        }
    });

    // Lautsprecher: nur Pegel protokollieren
    tokio::spawn(async move {
        while let Some(block) = lautsprecher_rx.recv().await {
            let energie: f64 = block.iter().map(|&s| (s as f64) * (s as f64)).sum();
            let rms = (energie / block.len().max(1) as f64).sqrt();
            tracing::trace!(samples = block.len(), rms, "Lautsprecher");
        }
    });

    let mut zeilen = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            zeile = zeilen.next_line() => match zeile? {
                Some(z) if z.trim() == "a" => {
                    if let Err(e) = handle.annehmen().await {
                        tracing::warn!(fehler = %e, "Annehmen nicht moeglich");
                    }
                }
                Some(z) if z.trim() == "s" => {
                    if let Err(e) = handle.stoppen().await {
                        tracing::warn!(fehler = %e, "Stoppen nicht moeglich");
                    }
                }
                Some(_) => tracing::info!(zustand = ?handle.zustand(), "Eingabe: a = annehmen, s = stoppen"),
                None => {
                    // stdin geschlossen, nur noch auf Ctrl-C warten
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Shutdown-Signal empfangen, Endpunkt wird beendet");
    handle.beenden().await;
    Ok(())
}
