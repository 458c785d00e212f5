/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Increment a counter once a second through a sentinel-managed master.  Trigger a failover
//! (`SENTINEL FAILOVER mymaster`) while it runs to watch writes move to the new master.
//!
//! Usage: `failover [sentinel[,sentinel...]] [master-name]`

use std::env;
use std::sync::Arc;
use std::time::Duration;

use redis_failover::{Command, HeartbeatService, ReplyKind, SentinelManager, Settings};

#[tokio::main]
async fn main() {
    env_logger::init();

    let sentinels = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:26379".to_string());
    let master_name = env::args().nth(2).unwrap_or_else(|| "mymaster".to_string());
    let sentinels: Vec<&str> = sentinels.split(',').collect();

    let mut settings =
        Settings::parse_sentinels(&sentinels, &master_name).expect("Invalid sentinel address");
    settings.heartbeat(true, Duration::from_secs(1));

    let handle = tokio::runtime::Handle::current();
    let heartbeat = HeartbeatService::new(Duration::from_millis(500));
    heartbeat.start(&handle, Duration::from_millis(250));

    let manager = SentinelManager::new(Arc::new(settings), handle, heartbeat.clone())
        .expect("Cannot create manager");
    manager.start().await.expect("Cannot reach any sentinel");
    println!(
        "{}: master {:?}, slaves {:?}",
        manager.master_name(),
        manager.masters(),
        manager.slaves()
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let incr = Command::new("INCR")
            .arg("failover-demo")
            .expect(ReplyKind::Integer);
        match manager.execute_async(incr).await {
            Ok(reply) => println!("{:?} via {:?}", reply, manager.masters()),
            Err(e) => println!("ERROR: {}", e),
        }
    }
}
