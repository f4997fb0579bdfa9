// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io::Result;

fn main() -> Result<()> {
    // Placement controllers filter clusters out of a freshly built context
    tonic_build::compile_protos("proto/placementcontroller.proto")?;

    // Action controllers materialize their intents into an existing context
    tonic_build::compile_protos("proto/contextupdate.proto")?;

    // Synchronizer readiness alerts (server streaming)
    tonic_build::compile_protos("proto/readynotify.proto")?;

    // Cluster lifecycle events fanned out by the cluster catalog
    tonic_build::compile_protos("proto/clmcontrollereventchannel.proto")?;

    // Synchronizer install/uninstall entry points
    tonic_build::compile_protos("proto/installapp.proto")?;

    println!("cargo:rerun-if-changed=proto");
    Ok(())
}
