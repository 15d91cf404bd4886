//! Fractional purchase example

use fractional_ledger::utils::MemoryStorage;
use fractional_ledger::{AssetType, FractionalLedger, LedgerConfig, Money, NewAsset, PurchaseError};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fractional_ledger::telemetry::init();
    println!("🛺 Fractional Ledger - Purchase Example\n");

    let ledger = FractionalLedger::bootstrap(MemoryStorage::new(), LedgerConfig::default()).await?;

    // 1. Register a vehicle under the built-in vehicle policy
    let asset = ledger
        .register_asset(NewAsset {
            id: "keke-lagos-01".to_string(),
            name: "Keke Lagos 01".to_string(),
            asset_type: AssetType::Vehicle,
            current_value: Money::from_major(100_000)?,
            min_investment: Money::from_major(1_000)?,
            revenue_policy_id: "vehicle".to_string(),
        })
        .await?;
    println!("  ✓ Registered {} worth {}", asset.name, asset.current_value);

    // 2. Fund two investors through verified gateway deposits
    for (owner, amount) in [("amaka", 70_000), ("tunde", 40_000)] {
        let wallet = ledger.open_wallet(owner).await?;
        ledger
            .deposit(&wallet.id, Money::from_major(amount)?, Money::ZERO, &format!("gw-{}", owner))
            .await?;
        println!("  ✓ Wallet for {} funded with {}", owner, Money::from_major(amount)?);
    }
    println!();

    // 3. Buy fractions
    println!("💰 Purchasing fractions...");
    let token = ledger
        .purchase(&asset.id, "amaka", Money::from_major(70_000)?, "order-amaka-1")
        .await?;
    println!("  ✓ amaka owns {} (token {})", token.fraction_owned, token.id);

    // A client retry with the same key returns the same token
    let replay = ledger
        .purchase(&asset.id, "amaka", Money::from_major(70_000)?, "order-amaka-1")
        .await?;
    println!("  ✓ Retry returned the same token: {}", replay.id == token.id);

    match ledger
        .purchase(&asset.id, "tunde", Money::from_major(35_000)?, "order-tunde-1")
        .await
    {
        Err(PurchaseError::Overallocated { requested_bps, remaining, .. }) => {
            println!("  ✗ tunde asked for {} bps but only {} remains", requested_bps, remaining);
        }
        other => println!("  ? unexpected outcome: {:?}", other.map(|t| t.id)),
    }

    let token = ledger
        .purchase(&asset.id, "tunde", Money::from_major(30_000)?, "order-tunde-2")
        .await?;
    println!("  ✓ tunde owns {}", token.fraction_owned);

    let asset = ledger.asset(&asset.id).await?;
    println!(
        "\n📊 {} sold {} ({:?})",
        asset.name, asset.total_ownership_sold, asset.status
    );
    println!("  amaka balance: {}", ledger.wallet_balance("amaka").await?);
    println!("  tunde balance: {}", ledger.wallet_balance("tunde").await?);

    let report = ledger.validate_integrity().await?;
    println!("\n🔍 Integrity check: {}", if report.is_valid { "clean" } else { "issues found" });

    Ok(())
}
