//! Revenue distribution example

use fractional_ledger::utils::MemoryStorage;
use fractional_ledger::{
    AssetType, CreditStatus, DistributionError, FractionalLedger, LedgerConfig, Money, NewAsset,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fractional_ledger::telemetry::init();
    println!("🔋 Fractional Ledger - Revenue Distribution Example\n");

    let ledger = FractionalLedger::bootstrap(MemoryStorage::new(), LedgerConfig::default()).await?;
    ledger
        .register_asset(NewAsset {
            id: "keke-abuja-07".to_string(),
            name: "Keke Abuja 07".to_string(),
            asset_type: AssetType::Vehicle,
            current_value: Money::from_major(100_000)?,
            min_investment: Money::from_major(1_000)?,
            revenue_policy_id: "vehicle".to_string(),
        })
        .await?;

    let mut wallets = Vec::new();
    for (owner, amount) in [("ngozi", 60_000), ("emeka", 40_000)] {
        let wallet = ledger.open_wallet(owner).await?;
        ledger
            .deposit(&wallet.id, Money::from_major(amount)?, Money::ZERO, &format!("gw-{}", owner))
            .await?;
        ledger
            .purchase("keke-abuja-07", owner, Money::from_major(amount)?, &format!("order-{}", owner))
            .await?;
        wallets.push(wallet);
    }

    // 1. January: everything is credited
    let payout = ledger
        .distribute("keke-abuja-07", "2025-01", Money::from_major(11_000)?)
        .await?;
    println!("📈 Payout {} for {}", payout.id, payout.period);
    for tier in &payout.tier_amounts {
        println!("  {:<12} {:>6}  {}", tier.tier.to_string(), tier.share.to_string(), tier.amount);
    }
    for allocation in &payout.allocations {
        println!(
            "  ✓ {} ({}) receives {}",
            allocation.owner_id, allocation.fraction, allocation.amount
        );
    }

    // 2. Running the same period again is refused
    if let Err(DistributionError::AlreadyDistributed { period, .. }) = ledger
        .distribute("keke-abuja-07", "2025-01", Money::from_major(11_000)?)
        .await
    {
        println!("\n  ✗ {} was already distributed", period);
    }

    // 3. February: one wallet is suspended, so that credit fails
    ledger.suspend_wallet(&wallets[1].id).await?;
    let payout = ledger
        .distribute("keke-abuja-07", "2025-02", Money::from_major(8_000)?)
        .await?;
    println!("\n⚠️  February partially succeeded: {}", payout.is_partial());
    for failed in payout.failed_allocations() {
        println!(
            "  ✗ {} not credited: {}",
            failed.owner_id,
            failed.failure_reason.as_deref().unwrap_or("unknown")
        );
    }

    // 4. The operator lifts the suspension and retries only that credit
    ledger.activate_wallet(&wallets[1].id).await?;
    for failed in payout.failed_allocations() {
        let allocation = ledger.retry_failed_credit(&payout.id, &failed.token_id).await?;
        if allocation.status == CreditStatus::Credited {
            println!("  ✓ {} credited {} on retry", allocation.owner_id, allocation.amount);
        }
    }

    println!("\n💼 Portfolios");
    for owner in ["ngozi", "emeka"] {
        for position in ledger.portfolio(owner).await? {
            println!(
                "  {} holds {} of {} worth {}, returns {} (ROI {}%)",
                owner,
                position.token.fraction_owned,
                position.asset_name,
                position.position_value,
                position.token.total_returns,
                position.roi
            );
        }
    }

    Ok(())
}
