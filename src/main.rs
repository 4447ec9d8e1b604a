use std::{error::Error, sync::Arc};

use bytes::Bytes;
use tokio::{
    runtime::Handle,
    signal::{
        self,
        unix::{SignalKind, signal as unix_signal},
    },
    task, time,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crabgate::{
    Config, ManagementContext, Service, Session, SessionHandler, WorkerPool,
    management::CounterExporter, transport::TcpTransport,
};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const APP_NAME: &str = "🦀 crabgate";

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = Config::load().await?;
    init_tracing(&config);

    let gateway = Gateway::start(&config)?;
    run_forever(&config, &gateway).await?;
    gateway.shutdown().await;

    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(config.log_level.as_str())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

struct Echo;

impl SessionHandler for Echo {
    fn message_received(&self, session: &Arc<Session>, message: &Bytes) {
        session.write(message.clone());
    }
}

struct Gateway {
    ctx: Arc<ManagementContext>,
    pool: Arc<WorkerPool>,
    services: Vec<Arc<Service>>,
    exporter: CounterExporter,
}

impl Gateway {
    fn start(config: &Config) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let gw = &config.gateway;
        let ctx = ManagementContext::new(&gw.name, gw.management_session_threshold)?;
        let pool = Arc::new(WorkerPool::new(gw.name.clone(), gw.workers)?);
        let transport = Arc::new(TcpTransport::new(Handle::current()));

        let mut services = Vec::with_capacity(gw.services.len());
        for entry in &gw.services {
            let service = Service::with_pool(
                entry.service_config(),
                transport.clone(),
                ctx.clone(),
                pool.clone(),
            )?;
            service.set_handler(Arc::new(Echo));

            for addr in &entry.listen {
                let bound = service.bind(*addr)?;
                info!("{APP_NAME} service '{}' listening on {bound}", entry.name);
            }
            services.push(service);
        }

        let exporter = CounterExporter::new(ctx.clone());

        Ok(Self {
            ctx,
            pool,
            services,
            exporter,
        })
    }

    fn report(&self) {
        let summary = self.ctx.gateway_bean().summary();
        info!(
            "{APP_NAME} sessions={} total={} read={}B written={}B exceptions={} strategy={}",
            summary.current_sessions,
            summary.total_sessions,
            summary.bytes_read,
            summary.bytes_written,
            summary.exceptions,
            self.ctx.active_bundle().kind(),
        );
    }

    async fn shutdown(self) {
        info!("{APP_NAME} shutting down");

        // disposal blocks until sessions are closed
        let Gateway {
            ctx,
            pool,
            services,
            exporter: _,
        } = self;

        let result = task::spawn_blocking(move || {
            for service in &services {
                service.dispose();
            }
            pool.shutdown();
            ctx.notifier().drain();
            ctx.notifier().shutdown();
        })
        .await;

        if let Err(e) = result {
            error!("shutdown failed: {e}");
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Run -------------------------------------------------------------------

async fn run_forever(config: &Config, gateway: &Gateway) -> std::io::Result<()> {
    let mut ticker = time::interval(config.gateway.report_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let mut hangup = unix_signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,

            // only the threshold is applied live; a CLI override still wins
            _ = hangup.recv() => match config.reload().await {
                Ok(fresh) => gateway
                    .ctx
                    .set_threshold(fresh.gateway.management_session_threshold),
                Err(e) => warn!("{APP_NAME} reload failed, keeping current config: {e}"),
            },

            _ = ticker.tick() => {
                gateway.report();

                if let Some(path) = &config.gateway.export_file {
                    gateway.exporter.refresh();
                    if let Err(e) = gateway.exporter.write_to(path).await {
                        warn!("counter export to {} failed: {e}", path.display());
                    }
                }
            }
        }
    }

    Ok(())
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
